//! Node list loading from files and URLs
//!
//! Two formats are understood:
//! - a JSON array of engine proxy entries (`name`, `type`, `server`, `port`, ...)
//! - plain proxy lists, one per line (`IP:PORT`, `IP:PORT:USER:PASS`,
//!   `USER:PASS@IP:PORT`, `scheme://[USER:PASS@]IP:PORT`)

use crate::error::{Result, SieveError};
use crate::proxy::models::{NodeDescriptor, NodeType};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default user agent for list downloads
const DEFAULT_USER_AGENT: &str = "node-sieve/0.1";

static URL_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks[45]h?)://(?:([^:@/]+):([^@/]+)@)?([^:/@]+):(\d+)/?$")
        .expect("Invalid url-format regex")
});

static AUTH_AT_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^:@]+):([^@]+)@([^:@]+):(\d+)$")
        .expect("Invalid auth-at regex")
});

/// Parser for node lists
pub struct NodeParser;

impl NodeParser {
    /// Parse a single proxy list line into an `http` or `socks5` node.
    ///
    /// Lines without a scheme default to `http`. `https://` becomes an
    /// `http` node with TLS; `socks4://` is not supported by the engine and
    /// is skipped.
    pub fn parse_line(line: &str) -> Option<NodeDescriptor> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if line.contains("://") {
            return Self::parse_url_format(line);
        }

        if let Some(caps) = AUTH_AT_FORMAT.captures(line) {
            let port: u16 = caps[4].parse().ok()?;
            return Some(build(NodeType::Http, &caps[3], port, Some((&caps[1], &caps[2])), false));
        }

        let parts: Vec<&str> = line.split(':').collect();
        match parts.as_slice() {
            [host, port] => {
                let port: u16 = port.parse().ok()?;
                Some(build(NodeType::Http, host, port, None, false))
            }
            [host, port, user, pass] => {
                let port: u16 = port.parse().ok()?;
                Some(build(NodeType::Http, host, port, Some((*user, *pass)), false))
            }
            _ => None,
        }
    }

    fn parse_url_format(line: &str) -> Option<NodeDescriptor> {
        let caps = URL_FORMAT.captures(line)?;

        let (node_type, tls) = match &caps[1] {
            "http" => (NodeType::Http, false),
            "https" => (NodeType::Http, true),
            "socks5" | "socks5h" => (NodeType::Socks5, false),
            other => {
                debug!("Skipping unsupported scheme {}: {}", other, line);
                return None;
            }
        };

        let port: u16 = caps[5].parse().ok()?;
        let auth = match (caps.get(2), caps.get(3)) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        };
        Some(build(node_type, &caps[4], port, auth, tls))
    }

    /// Parse a JSON array of engine proxy entries; malformed entries are skipped
    pub fn parse_json(content: &str) -> Result<Vec<NodeDescriptor>> {
        let entries: Vec<Value> = serde_json::from_str(content)?;
        let total = entries.len();

        let nodes: Vec<NodeDescriptor> = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<NodeDescriptor>(entry) {
                Ok(node) if node.port != 0 && !node.server.is_empty() => Some(node),
                Ok(node) => {
                    warn!("Skipping node without address: {}", node.name);
                    None
                }
                Err(e) => {
                    warn!("Skipping malformed node entry: {}", e);
                    None
                }
            })
            .collect();

        if nodes.len() < total {
            info!("Parsed {}/{} node entries", nodes.len(), total);
        }
        Ok(nodes)
    }

    /// Parse either format, decided by the first non-blank character
    pub fn parse_content(content: &str) -> Result<Vec<NodeDescriptor>> {
        if content.trim_start().starts_with('[') {
            Self::parse_json(content)
        } else {
            Ok(content.lines().filter_map(Self::parse_line).collect())
        }
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<NodeDescriptor>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| SieveError::ConfigLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_content(&content)
    }

    /// Download and parse a node list
    pub async fn fetch_url(client: &Client, url: &str) -> Result<Vec<NodeDescriptor>> {
        let content = client
            .get(url)
            .header(reqwest::header::USER_AGENT, DEFAULT_USER_AGENT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Self::parse_content(&content)
    }

    /// Load every source, drop repeated endpoints and de-duplicate names.
    ///
    /// An unreadable file is an error; a failing URL is logged and skipped.
    pub async fn load_sources(
        client: &Client,
        files: &[PathBuf],
        urls: &[String],
    ) -> Result<Vec<NodeDescriptor>> {
        let mut nodes = Vec::new();

        for path in files {
            let loaded = Self::parse_file(path)?;
            info!("Loaded {} nodes from {}", loaded.len(), path.display());
            nodes.extend(loaded);
        }

        for url in urls {
            match Self::fetch_url(client, url).await {
                Ok(loaded) => {
                    info!("Loaded {} nodes from {}", loaded.len(), url);
                    nodes.extend(loaded);
                }
                Err(e) => warn!("Failed to load {}: {}", url, e),
            }
        }

        Ok(NodeDescriptor::dedupe(unique_endpoints(nodes)))
    }
}

/// Keep the first node for each `(type, server, port)`
pub fn unique_endpoints(nodes: Vec<NodeDescriptor>) -> Vec<NodeDescriptor> {
    let total = nodes.len();
    let mut seen = HashSet::with_capacity(total);
    let unique: Vec<NodeDescriptor> = nodes
        .into_iter()
        .filter(|n| seen.insert((n.node_type, n.server.to_lowercase(), n.port)))
        .collect();

    if unique.len() < total {
        info!("Dropped {} duplicate endpoints", total - unique.len());
    }
    unique
}

fn build(
    node_type: NodeType,
    host: &str,
    port: u16,
    auth: Option<(&str, &str)>,
    tls: bool,
) -> NodeDescriptor {
    let name = format!("{}-{}:{}", node_type, host, port);
    let mut node = NodeDescriptor::new(name, node_type, host, port);
    if let Some((user, pass)) = auth {
        node = node.with_option("username", user).with_option("password", pass);
    }
    if tls {
        node = node.with_option("tls", true);
    }
    node
}
