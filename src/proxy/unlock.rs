//! Service unlock probing through a node listener
//!
//! Each service is one GET request and a rule over the response. The table is
//! plain data, so new services can be added from configuration.

use crate::proxy::checker::listener_client;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for a single service probe in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 8;

/// Desktop browser user agent sent with every probe
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Countries where Claude is unavailable
const CLAUDE_BLOCKED: &[&str] = &["AF", "BY", "CN", "CU", "HK", "IR", "KP", "MO", "RU", "SY"];

/// Predicate deciding whether a service is usable from a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum UnlockRule {
    /// HTTP 200
    StatusOk,
    /// Lowercased body contains `marker` and does not contain `unless`
    BodyContains {
        marker: String,
        #[serde(default)]
        unless: Option<String>,
    },
    /// Body contains any of `markers`
    BodyContainsAny { markers: Vec<String> },
    /// A `loc=XX` trace line names a country outside `blocked`
    TraceCountryNotIn { blocked: Vec<String> },
}

impl UnlockRule {
    pub fn evaluate(&self, status: u16, body: &str) -> bool {
        match self {
            UnlockRule::StatusOk => status == 200,
            UnlockRule::BodyContains { marker, unless } => {
                let text = body.to_lowercase();
                let hit = text.contains(&marker.to_lowercase());
                let vetoed = unless
                    .as_ref()
                    .is_some_and(|u| text.contains(&u.to_lowercase()));
                hit && !vetoed
            }
            UnlockRule::BodyContainsAny { markers } => markers.iter().any(|m| body.contains(m.as_str())),
            UnlockRule::TraceCountryNotIn { blocked } => body
                .lines()
                .find_map(|line| line.strip_prefix("loc="))
                .map(|code| {
                    let code = code.trim().to_uppercase();
                    !blocked.iter().any(|b| b.eq_ignore_ascii_case(&code))
                })
                .unwrap_or(false),
        }
    }
}

/// A probed service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockService {
    pub name: String,
    pub url: String,
    #[serde(flatten)]
    pub rule: UnlockRule,
}

impl UnlockService {
    pub fn new(name: &str, url: &str, rule: UnlockRule) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            rule,
        }
    }
}

/// The built-in service table
pub fn builtin_services() -> Vec<UnlockService> {
    vec![
        UnlockService::new(
            "ChatGPT",
            "https://ios.chat.openai.com/",
            UnlockRule::BodyContains {
                marker: "request is not allowed".to_string(),
                unless: Some("disallowed isp".to_string()),
            },
        ),
        UnlockService::new(
            "Claude",
            "https://claude.ai/cdn-cgi/trace",
            UnlockRule::TraceCountryNotIn {
                blocked: CLAUDE_BLOCKED.iter().map(|s| s.to_string()).collect(),
            },
        ),
        UnlockService::new(
            "Gemini",
            "https://gemini.google.com/",
            UnlockRule::BodyContainsAny {
                markers: vec!["45631641,null,true".to_string(), "45631641,null,1".to_string()],
            },
        ),
        UnlockService::new("Copilot", "https://copilot.microsoft.com/", UnlockRule::StatusOk),
        UnlockService::new("YouTube", "https://www.youtube.com/", UnlockRule::StatusOk),
    ]
}

/// Probes a set of services through one listener
#[derive(Debug, Clone)]
pub struct UnlockProbe {
    services: Vec<UnlockService>,
    timeout: Duration,
}

impl Default for UnlockProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }
}

impl UnlockProbe {
    /// Create a probe over the built-in service table
    pub fn new(timeout: Duration) -> Self {
        Self {
            services: builtin_services(),
            timeout,
        }
    }

    /// Add services, replacing built-ins with the same name
    pub fn with_services(mut self, extra: Vec<UnlockService>) -> Self {
        for svc in extra {
            match self.services.iter_mut().find(|s| s.name == svc.name) {
                Some(existing) => *existing = svc,
                None => self.services.push(svc),
            }
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn services(&self) -> &[UnlockService] {
        &self.services
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe `names` (every known service when empty) through the SOCKS
    /// listener on `listener_port`.
    pub async fn probe(&self, listener_port: u16, names: &[String]) -> BTreeMap<String, bool> {
        match listener_client(listener_port, self.timeout) {
            Ok(client) => self.probe_with_client(&client, names).await,
            Err(e) => {
                warn!(listener_port, "Failed to build unlock client: {}", e);
                self.select(names)
                    .into_iter()
                    .map(|svc| (svc.name.clone(), false))
                    .collect()
            }
        }
    }

    /// Probe `names` with an already configured client
    pub async fn probe_with_client(&self, client: &Client, names: &[String]) -> BTreeMap<String, bool> {
        let checks = self.select(names).into_iter().map(|svc| async move {
            let ok = self.check(client, svc).await;
            (svc.name.clone(), ok)
        });

        join_all(checks).await.into_iter().collect()
    }

    fn select(&self, names: &[String]) -> Vec<&UnlockService> {
        if names.is_empty() {
            return self.services.iter().collect();
        }

        names
            .iter()
            .filter_map(|name| {
                let found = self.services.iter().find(|s| &s.name == name);
                if found.is_none() {
                    warn!("Unknown unlock service: {}", name);
                }
                found
            })
            .collect()
    }

    async fn check(&self, client: &Client, svc: &UnlockService) -> bool {
        let response = client
            .get(&svc.url)
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .timeout(self.timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!(service = %svc.name, "Unlock probe failed: {}", e);
                return false;
            }
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => svc.rule.evaluate(status, &body),
            Err(e) => {
                debug!(service = %svc.name, "Unlock body read failed: {}", e);
                false
            }
        }
    }
}
