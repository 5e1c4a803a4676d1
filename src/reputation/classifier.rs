//! Datacenter classification from reputation signals

use crate::error::{Result, SieveError};
use crate::reputation::lookup::{AbuseRecord, ReputationRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::info;

const BUILTIN_DATA: &str = include_str!("../../data/datacenter.toml");

const DEFAULT_ABUSE_SCORE_THRESHOLD: u8 = 25;

/// Keyword hits listed in a reason before the rest are summarized
const MAX_LISTED_KEYWORDS: usize = 3;

pub const REASON_QUERY_FAILED: &str = "query failed, default keep";
pub const REASON_NO_SIGNAL: &str = "no datacenter signal";

#[derive(Debug, Deserialize)]
struct ClassifierData {
    #[serde(default)]
    datacenter_asn: Vec<AsnEntry>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    abuse_usage_types: Vec<String>,
    #[serde(default)]
    abuse_score_threshold: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct AsnEntry {
    asn: u32,
    #[serde(default)]
    name: String,
}

/// Immutable classification policy: ASN blacklist, keywords and AbuseIPDB
/// thresholds
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    asns: HashMap<u32, String>,
    keywords: Vec<String>,
    abuse_usage_types: HashSet<String>,
    abuse_score_threshold: u8,
}

impl ClassifierConfig {
    /// Load the table compiled into the binary
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_DATA)
    }

    /// Load a table from a TOML file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| SieveError::ConfigLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let data: ClassifierData = toml::from_str(contents)?;

        if data.datacenter_asn.is_empty() && data.keywords.is_empty() {
            return Err(SieveError::ClassifierData(
                "no datacenter ASNs or keywords defined".to_string(),
            ));
        }

        let keywords: Vec<String> = data
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        let config = Self {
            asns: data
                .datacenter_asn
                .into_iter()
                .map(|e| (e.asn, e.name))
                .collect(),
            keywords,
            abuse_usage_types: data
                .abuse_usage_types
                .iter()
                .map(|u| u.trim().to_lowercase())
                .collect(),
            abuse_score_threshold: data
                .abuse_score_threshold
                .unwrap_or(DEFAULT_ABUSE_SCORE_THRESHOLD),
        };

        info!(
            "Loaded classifier data: {} ASNs, {} keywords",
            config.asns.len(),
            config.keywords.len()
        );
        Ok(config)
    }

    pub fn with_abuse_score_threshold(mut self, threshold: u8) -> Self {
        self.abuse_score_threshold = threshold;
        self
    }

    pub fn contains_asn(&self, asn: u32) -> bool {
        self.asns.contains_key(&asn)
    }

    pub fn asn_count(&self) -> usize {
        self.asns.len()
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn abuse_score_threshold(&self) -> u8 {
        self.abuse_score_threshold
    }
}

/// Classification outcome with the signals that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub is_datacenter: bool,
    pub reason: String,
}

impl Verdict {
    fn keep(reason: &str) -> Self {
        Self {
            is_datacenter: false,
            reason: reason.to_string(),
        }
    }
}

/// Classifies IPs as datacenter or residential
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Datacenter if any signal fires; an unresolved record is always kept.
    pub fn classify(&self, record: &ReputationRecord, abuse: Option<&AbuseRecord>) -> Verdict {
        if !record.success {
            return Verdict::keep(REASON_QUERY_FAILED);
        }

        let mut reasons = Vec::new();

        if record.hosting {
            reasons.push("ip-api hosting flag".to_string());
        }

        if let Some(asn) = record.asn {
            if let Some(operator) = self.config.asns.get(&asn) {
                if operator.is_empty() {
                    reasons.push(format!("ASN {} in blacklist", asn));
                } else {
                    reasons.push(format!("ASN {} in blacklist ({})", asn, operator));
                }
            }
        }

        let text = format!("{} {} {}", record.org, record.isp, record.as_name).to_lowercase();
        let matched: Vec<&str> = self
            .config
            .keywords
            .iter()
            .filter(|kw| text.contains(kw.as_str()))
            .map(String::as_str)
            .collect();
        if !matched.is_empty() {
            let listed = matched[..matched.len().min(MAX_LISTED_KEYWORDS)].join(", ");
            if matched.len() > MAX_LISTED_KEYWORDS {
                reasons.push(format!(
                    "keywords: {} (+{} more)",
                    listed,
                    matched.len() - MAX_LISTED_KEYWORDS
                ));
            } else {
                reasons.push(format!("keywords: {}", listed));
            }
        }

        if let Some(abuse) = abuse.filter(|a| a.success) {
            if self
                .config
                .abuse_usage_types
                .contains(&abuse.usage_type.trim().to_lowercase())
            {
                reasons.push(format!("AbuseIPDB usage type: {}", abuse.usage_type));
            }
            if abuse.is_tor {
                reasons.push("AbuseIPDB: Tor exit node".to_string());
            }
            if abuse.abuse_score >= self.config.abuse_score_threshold {
                reasons.push(format!("AbuseIPDB abuse score {}", abuse.abuse_score));
            }
        }

        if reasons.is_empty() {
            Verdict::keep(REASON_NO_SIGNAL)
        } else {
            Verdict {
                is_datacenter: true,
                reason: reasons.join("; "),
            }
        }
    }
}
