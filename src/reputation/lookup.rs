//! IP intelligence lookups: ip-api.com (batched) and AbuseIPDB (per IP)

use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, error, info};

const IP_API_BATCH_URL: &str = "http://ip-api.com/batch";
const IP_API_FIELDS: &str = "status,country,countryCode,regionName,city,isp,org,as,hosting";

/// ip-api.com accepts at most 100 queries per batch request
const IP_API_MAX_CHUNK: usize = 100;

/// ip-api.com allows 15 batch requests per minute
const IP_API_CHUNK_INTERVAL_SECS: u64 = 4;

const ABUSEIPDB_CHECK_URL: &str = "https://api.abuseipdb.com/api/v2/check";

/// AbuseIPDB starts rejecting bursts above this many parallel requests
const ABUSEIPDB_MAX_CONCURRENCY: usize = 5;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Normalized ip-api.com result for one IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct ReputationRecord {
    pub ip: String,
    pub success: bool,
    pub country: String,
    pub country_code: String,
    pub region: String,
    pub city: String,
    pub isp: String,
    pub org: String,
    /// Raw AS string, e.g. `AS16509 Amazon.com, Inc.`
    pub as_name: String,
    pub asn: Option<u32>,
    pub hosting: bool,
}

impl ReputationRecord {
    /// A record for an IP whose lookup failed
    pub fn failed(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            ..Default::default()
        }
    }

    fn from_response(ip: &str, data: IpApiEntry) -> Self {
        Self {
            ip: ip.to_string(),
            success: data.status == "success",
            asn: parse_asn(&data.as_name),
            country: data.country,
            country_code: data.country_code,
            region: data.region_name,
            city: data.city,
            isp: data.isp,
            org: data.org,
            as_name: data.as_name,
            hosting: data.hosting,
        }
    }
}

/// Parse the AS number out of an `AS<n> <name>` string
pub fn parse_asn(as_str: &str) -> Option<u32> {
    let first = as_str.split_whitespace().next()?;
    if !first.get(..2)?.eq_ignore_ascii_case("as") {
        return None;
    }
    first.get(2..)?.parse().ok()
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct IpApiEntry {
    status: String,
    country: String,
    #[serde(rename = "countryCode")]
    country_code: String,
    #[serde(rename = "regionName")]
    region_name: String,
    city: String,
    isp: String,
    org: String,
    #[serde(rename = "as")]
    as_name: String,
    hosting: bool,
}

#[derive(Debug, Serialize)]
struct IpApiQuery<'a> {
    query: &'a str,
    fields: &'a str,
}

/// Configuration for the ip-api.com client
#[derive(Debug, Clone)]
pub struct IpApiConfig {
    pub endpoint: String,
    /// IPs per request, capped at the provider limit of 100
    pub chunk_size: usize,
    /// Pause between consecutive chunk requests
    pub chunk_interval: Duration,
    pub timeout: Duration,
}

impl Default for IpApiConfig {
    fn default() -> Self {
        Self {
            endpoint: IP_API_BATCH_URL.to_string(),
            chunk_size: IP_API_MAX_CHUNK,
            chunk_interval: Duration::from_secs(IP_API_CHUNK_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl IpApiConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Batch client for ip-api.com
#[derive(Debug, Clone)]
pub struct IpApiClient {
    config: IpApiConfig,
    client: Client,
}

impl IpApiClient {
    pub fn new(config: IpApiConfig) -> crate::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    /// Use an already configured HTTP client
    pub fn with_client(config: IpApiConfig, client: Client) -> Self {
        Self { config, client }
    }

    /// Look up every distinct IP in `ips` exactly once.
    ///
    /// A failed chunk request yields failed records for the IPs of that
    /// chunk only.
    pub async fn lookup_batch(&self, ips: &[String]) -> HashMap<String, ReputationRecord> {
        let unique = dedupe(ips);
        let chunk_size = self.config.chunk_size.clamp(1, IP_API_MAX_CHUNK);
        let mut records = HashMap::with_capacity(unique.len());

        let chunks: Vec<&[&str]> = unique.chunks(chunk_size).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            match self.query_chunk(chunk).await {
                Ok(entries) => {
                    for (ip, entry) in chunk.iter().zip(entries) {
                        records.insert(ip.to_string(), ReputationRecord::from_response(ip, entry));
                    }
                    // A short response leaves trailing IPs unanswered.
                    for ip in chunk.iter() {
                        records
                            .entry(ip.to_string())
                            .or_insert_with(|| ReputationRecord::failed(ip));
                    }
                }
                Err(e) => {
                    error!("ip-api batch query failed: {}", e);
                    for ip in chunk.iter() {
                        records.insert(ip.to_string(), ReputationRecord::failed(ip));
                    }
                }
            }

            if index + 1 < chunks.len() {
                debug!("ip-api rate limit pause {:?}", self.config.chunk_interval);
                tokio::time::sleep(self.config.chunk_interval).await;
            }
        }

        records
    }

    async fn query_chunk(&self, chunk: &[&str]) -> reqwest::Result<Vec<IpApiEntry>> {
        let payload: Vec<IpApiQuery<'_>> = chunk
            .iter()
            .map(|ip| IpApiQuery {
                query: ip,
                fields: IP_API_FIELDS,
            })
            .collect();

        self.client
            .post(&self.config.endpoint)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

/// Normalized AbuseIPDB result for one IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct AbuseRecord {
    pub ip: String,
    pub success: bool,
    pub abuse_score: u8,
    pub usage_type: String,
    pub isp: String,
    pub domain: String,
    pub is_tor: bool,
    pub is_whitelisted: bool,
    pub total_reports: u64,
    pub country_code: String,
}

impl AbuseRecord {
    /// A record for an IP whose lookup failed
    pub fn failed(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct AbuseEnvelope {
    #[serde(default)]
    data: Option<AbuseData>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct AbuseData {
    abuse_confidence_score: u8,
    usage_type: Option<String>,
    isp: Option<String>,
    domain: Option<String>,
    is_tor: bool,
    is_whitelisted: Option<bool>,
    total_reports: u64,
    country_code: Option<String>,
}

/// Configuration for the AbuseIPDB client
#[derive(Debug, Clone)]
pub struct AbuseIpDbConfig {
    pub endpoint: String,
    pub api_key: String,
    /// Parallel requests, capped at 5
    pub concurrency: usize,
    pub timeout: Duration,
}

impl AbuseIpDbConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            endpoint: ABUSEIPDB_CHECK_URL.to_string(),
            api_key,
            concurrency: ABUSEIPDB_MAX_CONCURRENCY,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Per-IP client for AbuseIPDB
#[derive(Debug, Clone)]
pub struct AbuseIpDbClient {
    config: AbuseIpDbConfig,
    client: Client,
}

impl AbuseIpDbClient {
    pub fn new(config: AbuseIpDbConfig) -> crate::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    /// Use an already configured HTTP client
    pub fn with_client(config: AbuseIpDbConfig, client: Client) -> Self {
        Self { config, client }
    }

    /// Look up every distinct IP in `ips` with bounded concurrency
    pub async fn lookup_batch(&self, ips: &[String]) -> HashMap<String, AbuseRecord> {
        let unique = dedupe(ips);
        if unique.is_empty() || self.config.api_key.is_empty() {
            return HashMap::new();
        }

        let workers = self
            .config
            .concurrency
            .clamp(1, ABUSEIPDB_MAX_CONCURRENCY)
            .min(unique.len());
        info!("AbuseIPDB lookup of {} IPs ({} parallel)", unique.len(), workers);

        let records: HashMap<String, AbuseRecord> = stream::iter(unique)
            .map(|ip| async move { (ip.to_string(), self.lookup_one(ip).await) })
            .buffer_unordered(workers)
            .collect()
            .await;

        let ok = records.values().filter(|r| r.success).count();
        info!("AbuseIPDB lookup finished: {}/{} succeeded", ok, records.len());
        records
    }

    async fn lookup_one(&self, ip: &str) -> AbuseRecord {
        match self.query(ip).await {
            Ok(Some(data)) => AbuseRecord {
                ip: ip.to_string(),
                success: true,
                abuse_score: data.abuse_confidence_score,
                usage_type: data.usage_type.unwrap_or_default(),
                isp: data.isp.unwrap_or_default(),
                domain: data.domain.unwrap_or_default(),
                is_tor: data.is_tor,
                is_whitelisted: data.is_whitelisted.unwrap_or(false),
                total_reports: data.total_reports,
                country_code: data.country_code.unwrap_or_default(),
            },
            Ok(None) => AbuseRecord::failed(ip),
            Err(e) => {
                debug!(ip, "AbuseIPDB query failed: {}", e);
                AbuseRecord::failed(ip)
            }
        }
    }

    async fn query(&self, ip: &str) -> reqwest::Result<Option<AbuseData>> {
        let envelope: AbuseEnvelope = self
            .client
            .get(&self.config.endpoint)
            .query(&[("ipAddress", ip)])
            .header("Key", &self.config.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data)
    }
}

/// Distinct IPs in first-seen order
fn dedupe(ips: &[String]) -> Vec<&str> {
    let mut seen = HashSet::with_capacity(ips.len());
    ips.iter()
        .map(String::as_str)
        .filter(|ip| seen.insert(*ip))
        .collect()
}
