//! Node and test result data models

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Engine protocol type of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    #[default]
    Http,
    Socks5,
    Ss,
    Ssr,
    Vmess,
    Vless,
    Trojan,
    Hysteria,
    Hysteria2,
    Tuic,
    Wireguard,
    Snell,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Http => "http",
            NodeType::Socks5 => "socks5",
            NodeType::Ss => "ss",
            NodeType::Ssr => "ssr",
            NodeType::Vmess => "vmess",
            NodeType::Vless => "vless",
            NodeType::Trojan => "trojan",
            NodeType::Hysteria => "hysteria",
            NodeType::Hysteria2 => "hysteria2",
            NodeType::Tuic => "tuic",
            NodeType::Wireguard => "wireguard",
            NodeType::Snell => "snell",
        };
        write!(f, "{}", s)
    }
}

/// A normalized proxy node, in the shape of an engine proxy entry.
///
/// Protocol-specific fields (credentials, transport options) are kept in
/// `options` and handed to the engine verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub server: String,
    pub port: u16,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl NodeDescriptor {
    /// Create a node without protocol options
    pub fn new(name: impl Into<String>, node_type: NodeType, server: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            node_type,
            server: server.into(),
            port,
            options: Map::new(),
        }
    }

    /// Add a protocol option
    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// Get the node address in HOST:PORT format
    pub fn address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    /// Render the engine proxy entry for this node under `name`
    pub fn to_engine_entry(&self, name: &str) -> Value {
        let mut entry = self.options.clone();
        entry.insert("name".into(), Value::from(name));
        entry.insert("type".into(), Value::from(self.node_type.to_string()));
        entry.insert("server".into(), Value::from(self.server.clone()));
        entry.insert("port".into(), Value::from(self.port));
        Value::Object(entry)
    }

    /// Rename colliding nodes so every name in the list is unique.
    pub fn dedupe(nodes: Vec<NodeDescriptor>) -> Vec<NodeDescriptor> {
        let names = resolve_names(&nodes);
        nodes
            .into_iter()
            .zip(names)
            .map(|(mut node, name)| {
                node.name = name;
                node
            })
            .collect()
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}://{})", self.name, self.node_type, self.address())
    }
}

/// Resolve duplicate node names in one deterministic pass over `nodes`.
///
/// The first occurrence keeps its name; later ones get `_1`, `_2`, ...
/// suffixes, skipping any suffix already taken by another node.
pub fn resolve_names(nodes: &[NodeDescriptor]) -> Vec<String> {
    let taken: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    let mut used: HashSet<String> = HashSet::with_capacity(nodes.len());
    let mut counters: HashMap<&str, usize> = HashMap::new();
    let mut resolved = Vec::with_capacity(nodes.len());

    for node in nodes {
        let base = node.name.as_str();
        if used.insert(base.to_string()) {
            resolved.push(base.to_string());
            continue;
        }

        let counter = counters.entry(base).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{}_{}", base, counter);
            if !taken.contains(candidate.as_str()) && used.insert(candidate.clone()) {
                resolved.push(candidate);
                break;
            }
        }
    }

    resolved
}

/// Outcome of testing one node through its listener.
///
/// Built only through [`TestResult::alive`] and [`TestResult::failed`], so a
/// dead node never carries an exit IP or unlock results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    name: String,
    alive: bool,
    delay_ms: u64,
    exit_ip: Option<String>,
    unlock: Option<BTreeMap<String, bool>>,
    error: Option<String>,
}

impl TestResult {
    pub fn alive(
        name: String,
        delay_ms: u64,
        exit_ip: Option<String>,
        unlock: Option<BTreeMap<String, bool>>,
    ) -> Self {
        Self {
            name,
            alive: true,
            delay_ms,
            exit_ip,
            unlock,
            error: None,
        }
    }

    pub fn failed(name: String, error: String) -> Self {
        Self {
            name,
            alive: false,
            delay_ms: 0,
            exit_ip: None,
            unlock: None,
            error: Some(error),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn exit_ip(&self) -> Option<&str> {
        self.exit_ip.as_deref()
    }

    pub fn unlock(&self) -> Option<&BTreeMap<String, bool>> {
        self.unlock.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(name: &str) -> NodeDescriptor {
        NodeDescriptor::new(name, NodeType::Ss, "1.2.3.4", 8388)
    }

    #[test]
    fn test_node_creation() {
        let node = NodeDescriptor::new("hk-01", NodeType::Trojan, "hk.example.com", 443)
            .with_option("password", "secret");
        assert_eq!(node.name, "hk-01");
        assert_eq!(node.node_type, NodeType::Trojan);
        assert_eq!(node.address(), "hk.example.com:443");
        assert_eq!(node.options.get("password"), Some(&json!("secret")));
    }

    #[test]
    fn test_node_deserialize_engine_entry() {
        let node: NodeDescriptor = serde_json::from_value(json!({
            "name": "jp-vmess",
            "type": "vmess",
            "server": "jp.example.com",
            "port": 443,
            "uuid": "b831381d-6324-4d53-ad4f-8cda48b30811",
            "alterId": 0,
            "network": "ws",
            "ws-opts": { "path": "/ray" }
        }))
        .unwrap();

        assert_eq!(node.node_type, NodeType::Vmess);
        assert_eq!(node.port, 443);
        assert_eq!(node.options.len(), 4);
        assert_eq!(node.options["ws-opts"]["path"], json!("/ray"));
    }

    #[test]
    fn test_engine_entry_uses_given_name() {
        let node = node("dup").with_option("cipher", "aes-128-gcm");
        let entry = node.to_engine_entry("dup_1");
        assert_eq!(entry["name"], json!("dup_1"));
        assert_eq!(entry["type"], json!("ss"));
        assert_eq!(entry["server"], json!("1.2.3.4"));
        assert_eq!(entry["port"], json!(8388));
        assert_eq!(entry["cipher"], json!("aes-128-gcm"));
    }

    #[test]
    fn test_resolve_names_suffixes_duplicates() {
        let nodes = vec![node("a"), node("b"), node("a"), node("a")];
        assert_eq!(resolve_names(&nodes), vec!["a", "b", "a_1", "a_2"]);
    }

    #[test]
    fn test_resolve_names_skips_taken_suffix() {
        let nodes = vec![node("a"), node("a"), node("a_1")];
        let names = resolve_names(&nodes);
        assert_eq!(names, vec!["a", "a_2", "a_1"]);
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn test_resolve_names_is_deterministic() {
        let nodes = vec![node("x"), node("x"), node("y"), node("x")];
        assert_eq!(resolve_names(&nodes), resolve_names(&nodes));
    }

    #[test]
    fn test_dedupe_renames_nodes() {
        let nodes = NodeDescriptor::dedupe(vec![node("n"), node("n")]);
        assert_eq!(nodes[0].name, "n");
        assert_eq!(nodes[1].name, "n_1");
    }

    #[test]
    fn test_test_result_constructors() {
        let mut unlock = BTreeMap::new();
        unlock.insert("YouTube".to_string(), true);
        let result = TestResult::alive("n".into(), 120, Some("203.0.113.7".into()), Some(unlock));
        assert!(result.is_alive());
        assert_eq!(result.delay_ms(), 120);
        assert_eq!(result.exit_ip(), Some("203.0.113.7"));
        assert!(result.error().is_none());

        let result = TestResult::failed("n".into(), "connection refused".into());
        assert!(!result.is_alive());
        assert_eq!(result.delay_ms(), 0);
        assert!(result.exit_ip().is_none());
        assert!(result.unlock().is_none());
        assert_eq!(result.error(), Some("connection refused"));
    }
}
