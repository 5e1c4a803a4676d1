//! IP reputation: provider lookups and datacenter classification
//!
//! - `lookup`: ip-api.com batch queries and AbuseIPDB checks
//! - `classifier`: fuses the records into a verdict with a reason string
//! - `detector`: runs both for a set of nodes, by exit or entry IP

pub mod classifier;
pub mod detector;
pub mod lookup;

pub use classifier::{Classifier, ClassifierConfig, Verdict};
pub use detector::{Detection, NodeVerdict, ReputationDetector};
pub use lookup::{
    AbuseIpDbClient, AbuseIpDbConfig, AbuseRecord, IpApiClient, IpApiConfig, ReputationRecord,
};
