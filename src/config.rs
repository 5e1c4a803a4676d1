//! Application configuration file

use crate::error::{Result, SieveError};
use crate::proxy::checker::{
    IpEndpoint, ValidatorConfig, DEFAULT_CONCURRENCY, DEFAULT_TEST_URL, DEFAULT_TIMEOUT_SECS,
};
use crate::proxy::engine::{EngineConfig, DEFAULT_ENGINE_BIN};
use crate::proxy::unlock::{UnlockProbe, UnlockService};
use crate::reputation::ClassifierConfig;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default report location
const DEFAULT_OUTPUT_PATH: &str = "node-sieve-report.json";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sources: SourcesConfig,
    pub filter: FilterConfig,
    pub connectivity: ConnectivityConfig,
    pub detection: DetectionConfig,
    pub output: OutputConfig,
}

/// Where node lists come from
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub files: Vec<PathBuf>,
    pub urls: Vec<String>,
}

impl SourcesConfig {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.urls.is_empty()
    }
}

/// Node name keywords
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub name_blacklist: Vec<String>,
    pub name_whitelist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub enabled: bool,
    pub engine_bin: PathBuf,
    pub test_url: String,
    pub timeout_secs: u64,
    pub concurrency: usize,
    /// `None` disables unlock probing; an empty list probes every service
    pub unlock_services: Option<Vec<String>>,
    /// Extra or replacement unlock services
    pub services: Vec<UnlockService>,
    /// Exit-IP endpoints tried in order; empty keeps the built-in chain
    pub ip_endpoints: Vec<IpEndpoint>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            engine_bin: PathBuf::from(DEFAULT_ENGINE_BIN),
            test_url: DEFAULT_TEST_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            concurrency: DEFAULT_CONCURRENCY,
            unlock_services: None,
            services: Vec::new(),
            ip_endpoints: Vec::new(),
        }
    }
}

impl ConnectivityConfig {
    pub fn validator_config(&self) -> ValidatorConfig {
        let timeout = Duration::from_secs(self.timeout_secs.max(1));
        let mut config = ValidatorConfig::new()
            .with_timeout(timeout)
            .with_concurrency(self.concurrency)
            .with_test_url(self.test_url.clone())
            .with_engine(EngineConfig::new().with_bin(self.engine_bin.clone()));

        if !self.ip_endpoints.is_empty() {
            config = config.with_ip_endpoints(self.ip_endpoints.clone());
        }
        if let Some(services) = &self.unlock_services {
            let probe = UnlockProbe::new(timeout).with_services(self.services.clone());
            config = config.with_unlock(services.clone(), probe);
        }
        config
    }
}

/// Which IP of a node is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DetectMode {
    /// The egress IP seen through the node (needs connectivity testing)
    Exit,
    /// The node's server address
    Entry,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub enabled: bool,
    /// Unset picks `exit` when connectivity testing runs, `entry` otherwise
    pub mode: Option<DetectMode>,
    pub abuseipdb_key: Option<String>,
    /// Replacement for the built-in ASN/keyword table
    pub classifier_data: Option<PathBuf>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: None,
            abuseipdb_key: None,
            classifier_data: None,
        }
    }
}

impl DetectionConfig {
    pub fn effective_mode(&self, connectivity_enabled: bool) -> DetectMode {
        match (self.mode, connectivity_enabled) {
            (Some(DetectMode::Exit), true) | (None, true) => DetectMode::Exit,
            _ => DetectMode::Entry,
        }
    }

    /// Load the configured classifier table, or the built-in one
    pub fn classifier_config(&self) -> Result<ClassifierConfig> {
        match &self.classifier_data {
            Some(path) => ClassifierConfig::from_path(path),
            None => ClassifierConfig::builtin(),
        }
    }

    pub fn abuse_key(&self) -> Option<&str> {
        self.abuseipdb_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_OUTPUT_PATH),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Config file locations in priority order:
    /// 1. $NODE_SIEVE_CONFIG
    /// 2. $XDG_CONFIG_HOME/node-sieve/config.toml
    /// 3. ~/.config/node-sieve/config.toml
    /// 4. ./config.toml
    pub fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(path) = env::var("NODE_SIEVE_CONFIG") {
            paths.push(PathBuf::from(path));
        }
        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("node-sieve/config.toml"));
        }
        if let Ok(home) = env::var("HOME") {
            paths.push(PathBuf::from(home).join(".config/node-sieve/config.toml"));
        }
        paths.push(PathBuf::from("config.toml"));
        paths
    }

    /// Get the default config file path: the first candidate that exists,
    /// or the highest-priority one when none does
    pub fn default_config_path() -> PathBuf {
        let candidates = Self::candidate_paths();
        first_existing(&candidates)
            .or_else(|| candidates.into_iter().next())
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| SieveError::ConfigLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load config from an explicit path, or the first existing candidate
    pub fn load_or_default(path: Option<PathBuf>) -> Result<AppConfig> {
        if let Some(p) = path {
            return Self::load_from_file(p);
        }

        let candidates = Self::candidate_paths();
        match first_existing(&candidates) {
            Some(path) => Self::load_from_file(path),
            None => {
                tracing::debug!("No config file found in {:?}, using defaults", candidates);
                Ok(AppConfig::default())
            }
        }
    }
}

fn first_existing(paths: &[PathBuf]) -> Option<PathBuf> {
    paths.iter().find(|p| p.is_file()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.sources.is_empty());
        assert!(!config.connectivity.enabled);
        assert_eq!(config.connectivity.engine_bin, PathBuf::from("mihomo"));
        assert!(config.detection.enabled);
        assert_eq!(config.detection.effective_mode(false), DetectMode::Entry);
        assert_eq!(config.detection.effective_mode(true), DetectMode::Exit);
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(
            r#"
[sources]
files = ["nodes.json"]
urls = ["https://example.com/list.txt"]

[filter]
name_blacklist = ["expire", "traffic"]

[connectivity]
enabled = true
engine_bin = "/opt/mihomo/mihomo"
timeout_secs = 5
concurrency = 50
unlock_services = ["ChatGPT", "Netflix"]

[[connectivity.services]]
name = "Netflix"
url = "https://www.netflix.com/title/81280792"
rule = "status_ok"

[[connectivity.ip_endpoints]]
url = "https://api.ipify.org?format=json"
shape = { json_field = "ip" }

[[connectivity.ip_endpoints]]
url = "https://ifconfig.me/ip"
shape = "plain_text"

[detection]
mode = "entry"
abuseipdb_key = "  "

[output]
path = "out/report.json"
"#,
        )
        .unwrap();

        assert_eq!(config.sources.files, vec![PathBuf::from("nodes.json")]);
        assert_eq!(config.filter.name_blacklist.len(), 2);
        assert_eq!(config.detection.effective_mode(true), DetectMode::Entry);
        assert_eq!(config.detection.abuse_key(), None);
        assert_eq!(config.output.path, PathBuf::from("out/report.json"));

        let validator = config.connectivity.validator_config();
        assert_eq!(validator.timeout, Duration::from_secs(5));
        assert_eq!(validator.unlock_probe.timeout(), Duration::from_secs(5));
        assert_eq!(
            validator.ip_endpoints,
            vec![
                IpEndpoint::json("https://api.ipify.org?format=json", "ip"),
                IpEndpoint::plain("https://ifconfig.me/ip"),
            ]
        );
        assert_eq!(validator.concurrency, 50);
        assert_eq!(validator.engine.bin, PathBuf::from("/opt/mihomo/mihomo"));
        assert_eq!(
            validator.unlock_services,
            Some(vec!["ChatGPT".to_string(), "Netflix".to_string()])
        );
        assert!(validator.unlock_probe.services().iter().any(|s| s.name == "Netflix"));
    }

    #[test]
    fn test_unlock_disabled_by_default() {
        let validator = ConnectivityConfig::default().validator_config();
        assert!(validator.unlock_services.is_none());
        assert_eq!(validator.test_url, DEFAULT_TEST_URL);
        assert_eq!(validator.ip_endpoints, ValidatorConfig::default().ip_endpoints);
    }

    #[test]
    fn test_candidate_paths_end_with_working_dir() {
        let candidates = ConfigLoader::candidate_paths();
        assert_eq!(candidates.last(), Some(&PathBuf::from("config.toml")));
    }

    #[test]
    fn test_first_existing_skips_missing_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("config.toml");
        std::fs::write(&present, "[output]\npath = \"r.json\"\n").unwrap();

        let candidates = vec![missing, present.clone(), PathBuf::from("config.toml")];
        assert_eq!(first_existing(&candidates), Some(present.clone()));
        assert_eq!(first_existing(&candidates[..1]), None);

        let config = ConfigLoader::load_from_file(&present).unwrap();
        assert_eq!(config.output.path, PathBuf::from("r.json"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[detection]\nabuseipdb_key = \"abc\"").unwrap();

        let config = ConfigLoader::load_or_default(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.detection.abuse_key(), Some("abc"));
        assert!(config.detection.classifier_config().is_ok());
    }

    #[test]
    fn test_load_errors() {
        let err = ConfigLoader::load_from_file("/nonexistent/node-sieve.toml").unwrap_err();
        assert!(matches!(err, SieveError::ConfigLoad { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connectivity]\nenabled = \"yes\"").unwrap();
        let err = ConfigLoader::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, SieveError::ConfigParse(_)));
    }

    #[test]
    fn test_missing_classifier_data_is_an_error() {
        let detection = DetectionConfig {
            classifier_data: Some(PathBuf::from("/nonexistent/datacenter.toml")),
            ..Default::default()
        };
        assert!(detection.classifier_config().is_err());
    }
}
