//! Keyword filtering on node names

use crate::proxy::models::NodeDescriptor;
use tracing::info;

pub const REASON_NAME_BLACKLIST: &str = "name blacklist";

/// Drops nodes whose name contains a blacklisted keyword, unless it also
/// contains a whitelisted one. Matching is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    blacklist: Vec<String>,
    whitelist: Vec<String>,
}

impl NameFilter {
    pub fn new(blacklist: &[String], whitelist: &[String]) -> Self {
        Self {
            blacklist: normalize(blacklist),
            whitelist: normalize(whitelist),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blacklist.is_empty()
    }

    pub fn allows(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        if self.whitelist.iter().any(|k| name.contains(k.as_str())) {
            return true;
        }
        !self.blacklist.iter().any(|k| name.contains(k.as_str()))
    }

    /// Split `nodes` into kept and removed nodes
    pub fn apply(&self, nodes: Vec<NodeDescriptor>) -> (Vec<NodeDescriptor>, Vec<NodeDescriptor>) {
        if self.is_empty() {
            return (nodes, Vec::new());
        }

        let total = nodes.len();
        let (kept, removed): (Vec<_>, Vec<_>) = nodes.into_iter().partition(|n| self.allows(&n.name));

        info!("Name filter: kept {}/{} nodes", kept.len(), total);
        (kept, removed)
    }
}

fn normalize(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}
