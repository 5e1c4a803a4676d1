//! Batch validation of nodes through engine listeners

use crate::proxy::engine::{BatchPlan, EngineConfig, EngineInstance};
use crate::proxy::models::{resolve_names, NodeDescriptor, TestResult};
use crate::proxy::ports::{self, API_PORT_BASE, LISTENER_PORT_BASE};
use crate::proxy::unlock::UnlockProbe;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Proxy as ReqwestProxy};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default timeout for node checks in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of nodes per batch
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Default URL to test nodes against
pub const DEFAULT_TEST_URL: &str = "https://www.gstatic.com/generate_204";

/// Delay between engine readiness and the first test request
const DEFAULT_WARMUP_MS: u64 = 1000;

/// How the "what is my IP" endpoint returns the address
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpShape {
    /// JSON object with the address in the named field
    JsonField(String),
    /// The whole body is the address
    PlainText,
}

/// One endpoint of the exit IP discovery chain
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IpEndpoint {
    pub url: String,
    pub shape: IpShape,
}

impl IpEndpoint {
    pub fn json(url: &str, field: &str) -> Self {
        Self {
            url: url.to_string(),
            shape: IpShape::JsonField(field.to_string()),
        }
    }

    pub fn plain(url: &str) -> Self {
        Self {
            url: url.to_string(),
            shape: IpShape::PlainText,
        }
    }

    /// Extract a syntactically valid IP from a response body
    pub fn extract(&self, body: &str) -> Option<String> {
        let candidate = match &self.shape {
            IpShape::PlainText => body.trim().to_string(),
            IpShape::JsonField(field) => {
                let value: serde_json::Value = serde_json::from_str(body).ok()?;
                value.get(field)?.as_str()?.trim().to_string()
            }
        };
        candidate.parse::<IpAddr>().ok().map(|ip| ip.to_string())
    }
}

/// The default exit IP discovery chain, tried in order
pub fn default_ip_endpoints() -> Vec<IpEndpoint> {
    vec![
        IpEndpoint::json("http://ip-api.com/json/?fields=query", "query"),
        IpEndpoint::json("https://api.ipify.org?format=json", "ip"),
        IpEndpoint::plain("https://ifconfig.me/ip"),
    ]
}

/// Configuration for the batch validator
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Timeout for each request made through a node
    pub timeout: Duration,
    /// Number of nodes per batch, which is also the worker pool size
    pub concurrency: usize,
    /// URL used to decide liveness
    pub test_url: String,
    /// Engine settings
    pub engine: EngineConfig,
    /// First port scanned for listeners
    pub listener_port_base: u16,
    /// First port scanned for the control API
    pub api_port_base: u16,
    /// Delay between engine readiness and testing
    pub warmup: Duration,
    /// Exit IP discovery chain
    pub ip_endpoints: Vec<IpEndpoint>,
    /// Services to probe for unlock status; `None` disables probing,
    /// an empty list probes every known service
    pub unlock_services: Option<Vec<String>>,
    /// Unlock service table
    pub unlock_probe: UnlockProbe,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        let timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);
        Self {
            timeout,
            concurrency: DEFAULT_CONCURRENCY,
            test_url: DEFAULT_TEST_URL.to_string(),
            engine: EngineConfig::default(),
            listener_port_base: LISTENER_PORT_BASE,
            api_port_base: API_PORT_BASE,
            warmup: Duration::from_millis(DEFAULT_WARMUP_MS),
            ip_endpoints: default_ip_endpoints(),
            unlock_services: None,
            unlock_probe: UnlockProbe::new(timeout),
        }
    }
}

impl ValidatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-request timeout, for unlock probes as well
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.unlock_probe = self.unlock_probe.with_timeout(timeout);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_port_bases(mut self, listener: u16, api: u16) -> Self {
        self.listener_port_base = listener;
        self.api_port_base = api;
        self
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_ip_endpoints(mut self, endpoints: Vec<IpEndpoint>) -> Self {
        self.ip_endpoints = endpoints;
        self
    }

    pub fn with_unlock(mut self, services: Vec<String>, probe: UnlockProbe) -> Self {
        self.unlock_services = Some(services);
        self.unlock_probe = probe;
        self
    }

    fn batch_size(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// Build a client that routes through the SOCKS listener on `port`
pub fn listener_client(port: u16, timeout: Duration) -> reqwest::Result<Client> {
    let proxy = ReqwestProxy::all(format!("socks5h://127.0.0.1:{}", port))?;
    Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()
}

/// Tests a single node through its listener
#[derive(Debug, Clone)]
pub struct NodeTester {
    config: Arc<ValidatorConfig>,
}

impl NodeTester {
    pub fn new(config: Arc<ValidatorConfig>) -> Self {
        Self { config }
    }

    /// Test the node reachable through the listener on `port`
    pub async fn test(&self, name: &str, port: u16) -> TestResult {
        let client = match listener_client(port, self.config.timeout) {
            Ok(client) => client,
            Err(e) => return TestResult::failed(name.to_string(), e.to_string()),
        };

        let result = self.test_with_client(name, &client).await;

        match (result.is_alive(), self.config.unlock_services.as_ref()) {
            (true, Some(services)) => {
                let unlock = self.config.unlock_probe.probe(port, services).await;
                TestResult::alive(
                    result.name().to_string(),
                    result.delay_ms(),
                    result.exit_ip().map(str::to_string),
                    Some(unlock),
                )
            }
            _ => result,
        }
    }

    /// Liveness, latency and exit IP using `client`; unlock probing is left
    /// to the caller.
    pub async fn test_with_client(&self, name: &str, client: &Client) -> TestResult {
        let delay = match check_delay(client, &self.config.test_url, self.config.timeout).await {
            Ok(delay) => delay,
            Err(reason) => {
                info!("  ✗ {} - {}", name, reason);
                return TestResult::failed(name.to_string(), reason);
            }
        };

        let exit_ip = discover_exit_ip(client, &self.config.ip_endpoints, self.config.timeout).await;
        info!(
            "  ✓ {} - {}ms - exit IP: {}",
            name,
            delay,
            exit_ip.as_deref().unwrap_or("unknown")
        );

        TestResult::alive(name.to_string(), delay, exit_ip, None)
    }
}

/// GET `url` and report the round trip in milliseconds on 200/204
pub async fn check_delay(client: &Client, url: &str, timeout: Duration) -> Result<u64, String> {
    let start = Instant::now();

    match tokio::time::timeout(timeout, client.get(url).send()).await {
        Ok(Ok(response)) => {
            let status = response.status().as_u16();
            if status == 200 || status == 204 {
                Ok(start.elapsed().as_millis() as u64)
            } else {
                Err(format!("HTTP status: {}", response.status()))
            }
        }
        Ok(Err(e)) => Err(if e.is_timeout() {
            "timeout".to_string()
        } else {
            e.to_string()
        }),
        Err(_) => Err("timeout".to_string()),
    }
}

/// Try each endpoint in order and return the first valid IP
pub async fn discover_exit_ip(client: &Client, endpoints: &[IpEndpoint], timeout: Duration) -> Option<String> {
    for endpoint in endpoints {
        let response = match client.get(&endpoint.url).timeout(timeout).send().await {
            Ok(r) if r.status().as_u16() == 200 => r,
            Ok(r) => {
                debug!(url = %endpoint.url, status = %r.status(), "Exit IP endpoint refused");
                continue;
            }
            Err(e) => {
                debug!(url = %endpoint.url, "Exit IP endpoint failed: {}", e);
                continue;
            }
        };

        let Ok(body) = response.text().await else {
            continue;
        };
        if let Some(ip) = endpoint.extract(&body) {
            return Some(ip);
        }
    }

    None
}

/// Validates nodes in sequential batches, one engine instance per batch
#[derive(Debug, Clone)]
pub struct BatchValidator {
    config: Arc<ValidatorConfig>,
}

impl BatchValidator {
    pub fn new() -> Self {
        Self::with_config(ValidatorConfig::default())
    }

    pub fn with_config(config: ValidatorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Test every node. Results are not in input order.
    pub async fn validate(&self, nodes: &[NodeDescriptor]) -> Vec<TestResult> {
        if nodes.is_empty() {
            return Vec::new();
        }

        let batch_size = self.config.batch_size();
        let total_batches = nodes.len().div_ceil(batch_size);
        info!(
            "Validating {} nodes in {} batches of up to {}",
            nodes.len(),
            total_batches,
            batch_size
        );

        let mut results = Vec::with_capacity(nodes.len());
        for (index, batch) in partition(nodes, batch_size).enumerate() {
            info!("── batch {}/{} ({} nodes) ──", index + 1, total_batches, batch.len());
            results.extend(self.run_batch(batch).await);
        }

        let alive = results.iter().filter(|r| r.is_alive()).count();
        info!("Validation finished: {}/{} alive", alive, results.len());
        results
    }

    async fn run_batch(&self, batch: &[NodeDescriptor]) -> Vec<TestResult> {
        let ports = match ports::allocate(batch.len(), self.config.listener_port_base, &[]) {
            Ok(ports) => ports,
            Err(e) => {
                error!("Port allocation failed: {}", e);
                return fail_batch(batch, e.to_string());
            }
        };
        let api_port = match ports::allocate(1, self.config.api_port_base, &ports) {
            Ok(api) => api[0],
            Err(e) => {
                error!("Control API port allocation failed: {}", e);
                return fail_batch(batch, e.to_string());
            }
        };

        let plan = BatchPlan::new(batch, &ports, api_port);
        let mut engine = EngineInstance::new(self.config.engine.clone());
        if let Err(e) = engine.start(&plan).await {
            error!("Engine start failed, skipping batch: {}", e);
            return fail_batch(batch, format!("engine start failed: {}", e));
        }

        tokio::time::sleep(self.config.warmup).await;
        let results = self.test_plan(&plan).await;
        engine.stop().await;
        results
    }

    async fn test_plan(&self, plan: &BatchPlan<'_>) -> Vec<TestResult> {
        let workers = plan.len().max(1);
        let jobs: Vec<(String, u16)> = plan
            .listeners()
            .iter()
            .map(|l| (l.name.clone(), l.port))
            .collect();

        stream::iter(jobs)
            .map(|(name, port)| {
                let tester = NodeTester::new(Arc::clone(&self.config));
                async move {
                    let task_name = name.clone();
                    let handle = tokio::spawn(async move { tester.test(&task_name, port).await });
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!("Test task for {} aborted: {}", name, e);
                            TestResult::failed(name, format!("test task aborted: {}", e))
                        }
                    }
                }
            })
            .buffer_unordered(workers)
            .collect::<Vec<_>>()
            .await
    }
}

impl Default for BatchValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Split nodes into consecutive batches of at most `size` nodes
pub fn partition(nodes: &[NodeDescriptor], size: usize) -> std::slice::Chunks<'_, NodeDescriptor> {
    nodes.chunks(size.max(1))
}

fn fail_batch(batch: &[NodeDescriptor], reason: String) -> Vec<TestResult> {
    resolve_names(batch)
        .into_iter()
        .map(|name| TestResult::failed(name, reason.clone()))
        .collect()
}
