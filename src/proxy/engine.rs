//! Lifecycle management for the external proxying engine (mihomo)
//!
//! One [`EngineInstance`] serves one batch of nodes. It renders an engine
//! configuration that binds a local SOCKS listener to every node, launches the
//! engine in a fresh work directory, waits for its control API, and tears
//! everything down again in [`EngineInstance::stop`].

use crate::error::{Result, SieveError};
use crate::proxy::models::{resolve_names, NodeDescriptor};
use reqwest::Client;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default engine binary name, looked up on PATH
pub const DEFAULT_ENGINE_BIN: &str = "mihomo";

const DEFAULT_READY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_STOP_GRACE_SECS: u64 = 5;
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const CONFIG_FILE: &str = "config.yaml";
const LOG_FILE: &str = "engine.log";
const LOG_TAIL_LINES: usize = 20;

/// Configuration for engine instances
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path or name of the engine binary
    pub bin: PathBuf,
    /// How long to wait for the control API after launch
    pub ready_timeout: Duration,
    /// Interval between control API polls
    pub poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: Duration,
    /// Directory under which per-instance work directories are created
    pub work_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from(DEFAULT_ENGINE_BIN),
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
            work_root: std::env::temp_dir(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.bin = bin.into();
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }
}

/// One node bound to a local listener port
#[derive(Debug, Clone)]
pub struct ListenerBinding<'a> {
    /// Resolved, batch-unique node name
    pub name: String,
    pub port: u16,
    pub node: &'a NodeDescriptor,
}

/// Name and port assignment for one batch.
///
/// Both the engine configuration and the validator's view of listeners are
/// derived from this plan, so duplicate-name resolution happens exactly once.
#[derive(Debug, Clone)]
pub struct BatchPlan<'a> {
    listeners: Vec<ListenerBinding<'a>>,
    api_port: u16,
}

impl<'a> BatchPlan<'a> {
    /// Bind `nodes[i]` to `ports[i]`. Extra nodes without a port are dropped.
    pub fn new(nodes: &'a [NodeDescriptor], ports: &[u16], api_port: u16) -> Self {
        let listeners = resolve_names(nodes)
            .into_iter()
            .zip(nodes)
            .zip(ports)
            .map(|((name, node), port)| ListenerBinding {
                name,
                port: *port,
                node,
            })
            .collect();

        Self {
            listeners,
            api_port,
        }
    }

    pub fn listeners(&self) -> &[ListenerBinding<'a>] {
        &self.listeners
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Render the engine configuration for this plan
    pub fn render_config(&self) -> Value {
        let names: Vec<&str> = self.listeners.iter().map(|l| l.name.as_str()).collect();

        let proxies: Vec<Value> = self
            .listeners
            .iter()
            .map(|l| l.node.to_engine_entry(&l.name))
            .collect();

        let listeners: Vec<Value> = self
            .listeners
            .iter()
            .map(|l| {
                json!({
                    "name": format!("socks-{}", l.name),
                    "type": "socks",
                    "listen": "127.0.0.1",
                    "port": l.port,
                    "proxy": l.name,
                })
            })
            .collect();

        json!({
            "mixed-port": 0,
            "external-controller": format!("127.0.0.1:{}", self.api_port),
            "mode": "rule",
            "log-level": "warning",
            "ipv6": false,
            "proxies": proxies,
            "listeners": listeners,
            "proxy-groups": [
                { "name": "GLOBAL", "type": "select", "proxies": names }
            ],
            "rules": ["MATCH,GLOBAL"],
        })
    }
}

/// Lifecycle state of an engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Ready,
    Stopping,
}

/// A running (or stopped) engine process for one batch
pub struct EngineInstance {
    config: EngineConfig,
    state: EngineState,
    child: Option<Child>,
    workdir: Option<PathBuf>,
    api_port: u16,
}

impl EngineInstance {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: EngineState::Stopped,
            child: None,
            workdir: None,
            api_port: 0,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Launch the engine for `plan` and wait until its control API answers.
    ///
    /// On failure every resource acquired so far is released before the
    /// error is returned.
    pub async fn start(&mut self, plan: &BatchPlan<'_>) -> Result<()> {
        if self.state != EngineState::Stopped {
            self.stop().await;
        }

        self.state = EngineState::Starting;
        self.api_port = plan.api_port();

        info!(
            api_port = plan.api_port(),
            listeners = plan.len(),
            "Starting engine"
        );

        match self.launch(plan).await {
            Ok(()) => {
                self.state = EngineState::Ready;
                info!(api_port = self.api_port, "Engine ready");
                Ok(())
            }
            Err(e) => {
                if let Some(tail) = self.log_tail() {
                    warn!("Engine failed to start: {}\n{}", e, tail);
                } else {
                    warn!("Engine failed to start: {}", e);
                }
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn launch(&mut self, plan: &BatchPlan<'_>) -> Result<()> {
        let workdir = self
            .config
            .work_root
            .join(format!("node-sieve-{}", Uuid::new_v4()));
        fs::create_dir_all(&workdir).map_err(|source| SieveError::WorkDir {
            path: workdir.clone(),
            source,
        })?;
        self.workdir = Some(workdir.clone());

        let rendered = serde_json::to_vec_pretty(&plan.render_config())?;
        let config_path = workdir.join(CONFIG_FILE);
        fs::write(&config_path, rendered).map_err(|source| SieveError::WorkDir {
            path: config_path,
            source,
        })?;

        let log_path = workdir.join(LOG_FILE);
        let log = fs::File::create(&log_path).map_err(|source| SieveError::WorkDir {
            path: log_path,
            source,
        })?;
        let log_err = log.try_clone()?;

        let mut std_cmd = std::process::Command::new(&self.config.bin);
        std_cmd
            .arg("-d")
            .arg(&workdir)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SieveError::EngineNotFound(self.config.bin.clone()),
            _ => SieveError::EngineSpawn(e),
        })?;
        debug!(pid = ?child.id(), workdir = %workdir.display(), "Engine spawned");
        self.child = Some(child);

        self.wait_ready(plan.api_port()).await
    }

    async fn wait_ready(&mut self, api_port: u16) -> Result<()> {
        let url = format!("http://127.0.0.1:{}/version", api_port);
        let client = Client::builder()
            .timeout(READY_PROBE_TIMEOUT)
            .no_proxy()
            .build()?;
        let deadline = Instant::now() + self.config.ready_timeout;

        loop {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(SieveError::EngineExited {
                        status: status.to_string(),
                    });
                }
            }

            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().as_u16() == 200 {
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                return Err(SieveError::EngineTimeout {
                    secs: self.config.ready_timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Terminate the engine and remove its work directory.
    ///
    /// Safe to call in any state and any number of times.
    pub async fn stop(&mut self) {
        if self.child.is_none() && self.workdir.is_none() {
            self.state = EngineState::Stopped;
            return;
        }

        self.state = EngineState::Stopping;

        if let Some(mut child) = self.child.take() {
            terminate(&mut child, self.config.stop_grace).await;
            info!(api_port = self.api_port, "Engine stopped");
        }

        if let Some(dir) = self.workdir.take() {
            remove_workdir(&dir);
        }

        self.state = EngineState::Stopped;
    }

    fn log_tail(&self) -> Option<String> {
        let log = fs::read_to_string(self.workdir.as_ref()?.join(LOG_FILE)).ok()?;
        let lines: Vec<&str> = log.lines().collect();
        if lines.is_empty() {
            return None;
        }
        let start = lines.len().saturating_sub(LOG_TAIL_LINES);
        Some(lines[start..].join("\n"))
    }
}

impl Drop for EngineInstance {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                signal_group(pid, Signal::Kill);
            }
            let _ = child.start_kill();
        }
        if let Some(dir) = self.workdir.take() {
            remove_workdir(&dir);
        }
    }
}

async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    signal_group(pid, Signal::Term);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(pid, %status, "Engine exited"),
        Ok(Err(e)) => {
            warn!(pid, "Failed waiting for engine: {}", e);
            force_kill(child, pid).await;
        }
        Err(_) => {
            warn!(pid, "Engine ignored SIGTERM for {:?}, killing", grace);
            force_kill(child, pid).await;
        }
    }
}

async fn force_kill(child: &mut Child, pid: u32) {
    signal_group(pid, Signal::Kill);
    if let Err(e) = child.kill().await {
        debug!(pid, "Kill after group signal: {}", e);
    }
}

fn remove_workdir(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dir.display(), "Failed to remove engine work directory: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal the whole process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // The engine was spawned with process_group(0), so its pgid equals its pid.
    unsafe {
        libc::kill(-pgid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::NodeType;

    fn nodes() -> Vec<NodeDescriptor> {
        vec![
            NodeDescriptor::new("hk", NodeType::Ss, "1.1.1.1", 8388).with_option("cipher", "aes-128-gcm"),
            NodeDescriptor::new("jp", NodeType::Trojan, "jp.example.com", 443),
            NodeDescriptor::new("hk", NodeType::Vmess, "2.2.2.2", 443),
        ]
    }

    #[test]
    fn test_batch_plan_resolves_names_once() {
        let nodes = nodes();
        let plan = BatchPlan::new(&nodes, &[20001, 20002, 20003], 19000);
        let names: Vec<&str> = plan.listeners().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["hk", "jp", "hk_1"]);
        assert_eq!(plan.listeners()[2].port, 20003);
        assert_eq!(plan.listeners()[2].node.server, "2.2.2.2");
        assert_eq!(plan.api_port(), 19000);
    }

    #[test]
    fn test_render_config_matches_plan() {
        let nodes = nodes();
        let plan = BatchPlan::new(&nodes, &[20001, 20002, 20003], 19005);
        let config = plan.render_config();

        assert_eq!(config["external-controller"], json!("127.0.0.1:19005"));
        assert_eq!(config["mixed-port"], json!(0));
        assert_eq!(config["rules"], json!(["MATCH,GLOBAL"]));

        let proxies = config["proxies"].as_array().unwrap();
        let listeners = config["listeners"].as_array().unwrap();
        assert_eq!(proxies.len(), 3);
        assert_eq!(listeners.len(), 3);

        // Every listener routes to a proxy entry of the same name on its planned port.
        for (binding, listener) in plan.listeners().iter().zip(listeners) {
            assert_eq!(listener["proxy"], json!(binding.name));
            assert_eq!(listener["port"], json!(binding.port));
            assert_eq!(listener["type"], json!("socks"));
            assert!(proxies.iter().any(|p| p["name"] == json!(binding.name)));
        }

        assert_eq!(proxies[0]["cipher"], json!("aes-128-gcm"));
        assert_eq!(
            config["proxy-groups"][0]["proxies"],
            json!(["hk", "jp", "hk_1"])
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_never_started() {
        let mut engine = EngineInstance::new(EngineConfig::default());
        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_start_missing_binary_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let config = EngineConfig::new()
            .with_bin("/nonexistent/engine-binary")
            .with_work_root(root.path());
        let nodes = nodes();
        let plan = BatchPlan::new(&nodes, &[20001, 20002, 20003], 19000);

        let mut engine = EngineInstance::new(config);
        let err = engine.start(&plan).await.unwrap_err();

        assert!(matches!(err, SieveError::EngineNotFound(_)));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.workdir().is_none());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-engine.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_fails_fast_when_engine_exits() {
        let bin_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let bin = write_script(bin_dir.path(), "echo 'fatal: bad config' >&2\nexit 3");
        let config = EngineConfig::new()
            .with_bin(bin)
            .with_work_root(root.path())
            .with_ready_timeout(Duration::from_secs(30))
            .with_poll_interval(Duration::from_millis(50));
        let nodes = nodes();
        let plan = BatchPlan::new(&nodes, &[20001, 20002, 20003], 19000);

        let started = std::time::Instant::now();
        let mut engine = EngineInstance::new(config);
        let err = engine.start(&plan).await.unwrap_err();

        assert!(matches!(err, SieveError::EngineExited { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_timeout_kills_engine() {
        let bin_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let bin = write_script(bin_dir.path(), "exec sleep 30");
        let free = crate::proxy::ports::allocate(1, 43000, &[]).unwrap();
        let config = EngineConfig::new()
            .with_bin(bin)
            .with_work_root(root.path())
            .with_ready_timeout(Duration::from_millis(300))
            .with_poll_interval(Duration::from_millis(50))
            .with_stop_grace(Duration::from_secs(2));
        let nodes = nodes();
        let plan = BatchPlan::new(&nodes, &[20001, 20002, 20003], free[0]);

        let started = std::time::Instant::now();
        let mut engine = EngineInstance::new(config);
        let err = engine.start(&plan).await.unwrap_err();

        assert!(matches!(err, SieveError::EngineTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
