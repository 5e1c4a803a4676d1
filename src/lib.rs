//! node-sieve - proxy node validation and datacenter detection
//!
//! Tests proxy nodes through a `mihomo` engine (liveness, latency, exit IP,
//! service unlock) and classifies node IPs as residential or datacenter
//! from several IP reputation sources.

pub mod config;
pub mod error;
pub mod proxy;
pub mod report;
pub mod reputation;

#[cfg(test)]
mod testutil;

pub use config::{AppConfig, ConfigLoader, DetectMode};
pub use error::{Result, SieveError};
pub use proxy::*;
pub use report::{Disposition, RunReport};
pub use reputation::{Classifier, ClassifierConfig, Detection, ReputationDetector, Verdict};
