//! Residential/datacenter detection for nodes, by exit IP or entry IP

use crate::proxy::models::{NodeDescriptor, TestResult};
use crate::reputation::classifier::{Classifier, Verdict};
use crate::reputation::lookup::{AbuseIpDbClient, IpApiClient};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

/// Parallel DNS resolutions in entry mode
const DNS_CONCURRENCY: usize = 20;

const DNS_TIMEOUT_SECS: u64 = 5;

/// Classification of one IP together with what the lookup said about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeVerdict {
    pub ip: String,
    pub org: String,
    pub country_code: String,
    #[serde(flatten)]
    pub verdict: Verdict,
}

/// Per-node verdicts, plus nodes that had no usable IP
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub verdicts: BTreeMap<String, NodeVerdict>,
    pub unknown: Vec<String>,
}

impl Detection {
    pub fn datacenter_count(&self) -> usize {
        self.verdicts.values().filter(|v| v.verdict.is_datacenter).count()
    }

    pub fn residential_count(&self) -> usize {
        self.verdicts.len() - self.datacenter_count()
    }
}

/// Runs lookups and classification for a set of nodes
#[derive(Debug, Clone)]
pub struct ReputationDetector {
    lookup: IpApiClient,
    abuse: Option<AbuseIpDbClient>,
    classifier: Classifier,
}

impl ReputationDetector {
    pub fn new(lookup: IpApiClient, classifier: Classifier) -> Self {
        Self {
            lookup,
            abuse: None,
            classifier,
        }
    }

    pub fn with_abuse(mut self, abuse: AbuseIpDbClient) -> Self {
        self.abuse = Some(abuse);
        self
    }

    /// Classify the exit IPs of alive results
    pub async fn detect_exit(&self, results: &[TestResult]) -> Detection {
        let mut targets = Vec::new();
        let mut unknown = Vec::new();

        for result in results.iter().filter(|r| r.is_alive()) {
            match result.exit_ip() {
                Some(ip) => targets.push((result.name().to_string(), ip.to_string())),
                None => unknown.push(result.name().to_string()),
            }
        }

        info!(
            "Exit IP detection: {} nodes with exit IP, {} without",
            targets.len(),
            unknown.len()
        );
        self.detect(targets, unknown).await
    }

    /// Classify each node's server address without going through the node
    pub async fn detect_entry(&self, nodes: &[NodeDescriptor]) -> Detection {
        let resolved: Vec<(String, Option<String>)> = stream::iter(nodes)
            .map(|node| async move { (node.name.clone(), resolve_host(&node.server).await) })
            .buffer_unordered(DNS_CONCURRENCY)
            .collect()
            .await;

        let mut targets = Vec::new();
        let mut unknown = Vec::new();
        for (name, ip) in resolved {
            match ip {
                Some(ip) => targets.push((name, ip)),
                None => unknown.push(name),
            }
        }
        unknown.sort();

        info!(
            "Entry IP detection: {} nodes resolved, {} unresolved",
            targets.len(),
            unknown.len()
        );
        self.detect(targets, unknown).await
    }

    /// Look up and classify IPs directly, keyed by IP
    pub async fn classify_ips(&self, ips: &[String]) -> HashMap<String, NodeVerdict> {
        let records = self.lookup.lookup_batch(ips).await;
        let abuse = match &self.abuse {
            Some(client) => client.lookup_batch(ips).await,
            None => HashMap::new(),
        };

        records
            .into_iter()
            .map(|(ip, record)| {
                let verdict = self.classifier.classify(&record, abuse.get(&ip));
                debug!(%ip, datacenter = verdict.is_datacenter, "{}", verdict.reason);
                let node_verdict = NodeVerdict {
                    ip: ip.clone(),
                    org: record.org,
                    country_code: record.country_code,
                    verdict,
                };
                (ip, node_verdict)
            })
            .collect()
    }

    async fn detect(&self, targets: Vec<(String, String)>, unknown: Vec<String>) -> Detection {
        let ips: Vec<String> = targets.iter().map(|(_, ip)| ip.clone()).collect();
        let by_ip = self.classify_ips(&ips).await;

        let mut detection = Detection {
            verdicts: BTreeMap::new(),
            unknown,
        };
        for (name, ip) in targets {
            match by_ip.get(&ip) {
                Some(v) => {
                    detection.verdicts.insert(name, v.clone());
                }
                None => detection.unknown.push(name),
            }
        }

        info!(
            "Detection finished: {} residential, {} datacenter, {} unknown",
            detection.residential_count(),
            detection.datacenter_count(),
            detection.unknown.len()
        );
        detection
    }
}

/// Resolve a server address to one IP, preferring IPv4
async fn resolve_host(server: &str) -> Option<String> {
    let host = server.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip.to_string());
    }

    let lookup = tokio::net::lookup_host((host, 0));
    match tokio::time::timeout(Duration::from_secs(DNS_TIMEOUT_SECS), lookup).await {
        Ok(Ok(addrs)) => {
            let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            addrs
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| addrs.first())
                .map(IpAddr::to_string)
        }
        Ok(Err(e)) => {
            debug!(host, "DNS resolution failed: {}", e);
            None
        }
        Err(_) => {
            debug!(host, "DNS resolution timed out");
            None
        }
    }
}
