//! Run report: nodes joined with their test results and verdicts

use crate::error::Result;
use crate::proxy::filter::REASON_NAME_BLACKLIST;
use crate::proxy::models::{NodeDescriptor, NodeType, TestResult};
use crate::reputation::detector::Detection;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::info;

/// What happened to a node in this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Passed every enabled stage
    Kept,
    Datacenter,
    /// Failed connectivity testing
    Dead,
    /// Removed by the name filter
    Filtered,
    /// Alive but no IP could be classified; still kept
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub server: String,
    pub port: u16,
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock: Option<BTreeMap<String, bool>>,
}

impl NodeReport {
    fn new(node: &NodeDescriptor, disposition: Disposition) -> Self {
        Self {
            name: node.name.clone(),
            node_type: node.node_type,
            server: node.server.clone(),
            port: node.port,
            disposition,
            reason: None,
            delay_ms: None,
            ip: None,
            org: None,
            country_code: None,
            unlock: None,
        }
    }

    /// Whether the node belongs in the output list
    pub fn is_kept(&self) -> bool {
        matches!(self.disposition, Disposition::Kept | Disposition::Unknown)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub kept: usize,
    pub datacenter: usize,
    pub dead: usize,
    pub filtered: usize,
    pub unknown: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub summary: Summary,
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    /// Join the stages of one run.
    ///
    /// `nodes` are the nodes that passed the name filter; `results` is
    /// present when connectivity testing ran and `detection` when
    /// classification ran.
    pub fn build(
        nodes: &[NodeDescriptor],
        filtered: &[NodeDescriptor],
        results: Option<&[TestResult]>,
        detection: Option<&Detection>,
    ) -> Self {
        let results: HashMap<&str, &TestResult> = results
            .unwrap_or_default()
            .iter()
            .map(|r| (r.name(), r))
            .collect();

        let mut reports: Vec<NodeReport> = filtered
            .iter()
            .map(|node| {
                let mut report = NodeReport::new(node, Disposition::Filtered);
                report.reason = Some(REASON_NAME_BLACKLIST.to_string());
                report
            })
            .collect();

        for node in nodes {
            let result = results.get(node.name.as_str());
            let mut report = NodeReport::new(node, Disposition::Kept);

            if let Some(result) = result {
                if !result.is_alive() {
                    report.disposition = Disposition::Dead;
                    report.reason = result.error().map(str::to_string);
                    reports.push(report);
                    continue;
                }
                report.delay_ms = Some(result.delay_ms());
                report.ip = result.exit_ip().map(str::to_string);
                report.unlock = result.unlock().cloned();
            }

            if let Some(detection) = detection {
                match detection.verdicts.get(&node.name) {
                    Some(v) => {
                        report.disposition = if v.verdict.is_datacenter {
                            Disposition::Datacenter
                        } else {
                            Disposition::Kept
                        };
                        report.reason = Some(v.verdict.reason.clone());
                        report.ip = Some(v.ip.clone());
                        report.org = Some(v.org.clone());
                        report.country_code = Some(v.country_code.clone());
                    }
                    None => report.disposition = Disposition::Unknown,
                }
            }

            reports.push(report);
        }

        let summary = summarize(&reports);
        Self {
            generated_at: Utc::now(),
            summary,
            nodes: reports,
        }
    }

    pub fn kept(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.is_kept())
    }

    /// Write the report as pretty JSON, creating parent directories
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Report written to {}", path.display());
        Ok(())
    }
}

fn summarize(reports: &[NodeReport]) -> Summary {
    let mut summary = Summary {
        total: reports.len(),
        ..Default::default()
    };
    for report in reports {
        match report.disposition {
            Disposition::Kept => summary.kept += 1,
            Disposition::Datacenter => summary.datacenter += 1,
            Disposition::Dead => summary.dead += 1,
            Disposition::Filtered => summary.filtered += 1,
            Disposition::Unknown => summary.unknown += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reputation::classifier::Verdict;
    use crate::reputation::detector::NodeVerdict;

    fn node(name: &str) -> NodeDescriptor {
        NodeDescriptor::new(name, NodeType::Vmess, "node.example.com", 443)
    }

    fn verdict(ip: &str, datacenter: bool, reason: &str) -> NodeVerdict {
        NodeVerdict {
            ip: ip.to_string(),
            org: "Example Org".to_string(),
            country_code: "US".to_string(),
            verdict: Verdict {
                is_datacenter: datacenter,
                reason: reason.to_string(),
            },
        }
    }

    #[test]
    fn test_build_joins_every_stage() {
        let nodes = vec![node("home"), node("aws"), node("dead"), node("mystery")];
        let filtered = vec![node("expired")];
        let results = vec![
            TestResult::alive("home".to_string(), 120, Some("198.51.100.20".to_string()), None),
            TestResult::alive("aws".to_string(), 80, Some("3.5.140.2".to_string()), None),
            TestResult::failed("dead".to_string(), "timeout".to_string()),
            TestResult::alive("mystery".to_string(), 200, None, None),
        ];
        let mut detection = Detection::default();
        detection
            .verdicts
            .insert("home".to_string(), verdict("198.51.100.20", false, "no datacenter signal"));
        detection
            .verdicts
            .insert("aws".to_string(), verdict("3.5.140.2", true, "ip-api hosting flag"));
        detection.unknown.push("mystery".to_string());

        let report = RunReport::build(&nodes, &filtered, Some(&results), Some(&detection));

        assert_eq!(
            report.summary,
            Summary {
                total: 5,
                kept: 1,
                datacenter: 1,
                dead: 1,
                filtered: 1,
                unknown: 1,
            }
        );

        let by_name: HashMap<&str, &NodeReport> =
            report.nodes.iter().map(|n| (n.name.as_str(), n)).collect();
        assert_eq!(by_name["expired"].reason.as_deref(), Some("name blacklist"));
        assert_eq!(by_name["dead"].reason.as_deref(), Some("timeout"));
        assert_eq!(by_name["dead"].delay_ms, None);
        assert_eq!(by_name["aws"].reason.as_deref(), Some("ip-api hosting flag"));
        assert_eq!(by_name["home"].delay_ms, Some(120));

        let kept: Vec<&str> = report.kept().map(|n| n.name.as_str()).collect();
        assert_eq!(kept, vec!["home", "mystery"]);
    }

    #[test]
    fn test_build_without_testing_or_detection() {
        let report = RunReport::build(&[node("a"), node("b")], &[], None, None);
        assert_eq!(report.summary.kept, 2);
        assert!(report.nodes.iter().all(|n| n.reason.is_none()));
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.json");

        let report = RunReport::build(&[node("a")], &[], None, None);
        report.write_json(&path).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["summary"]["total"], 1);
        assert_eq!(written["nodes"][0]["disposition"], "kept");
        assert_eq!(written["nodes"][0]["type"], "vmess");
        assert!(written["generated_at"].is_string());
    }
}
