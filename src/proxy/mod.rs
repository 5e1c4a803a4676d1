//! Proxy node handling
//!
//! This module provides functionality for:
//! - Loading node lists from files and URLs
//! - Filtering nodes by name
//! - Driving the proxy engine to test nodes in batches
//! - Probing service unlock status through live nodes

pub mod checker;
pub mod engine;
pub mod filter;
pub mod models;
pub mod parser;
pub mod ports;
pub mod unlock;

pub use checker::{BatchValidator, IpEndpoint, NodeTester, ValidatorConfig};
pub use engine::{BatchPlan, EngineConfig, EngineInstance, EngineState};
pub use filter::NameFilter;
pub use models::{NodeDescriptor, NodeType, TestResult};
pub use parser::NodeParser;
pub use unlock::{UnlockProbe, UnlockRule, UnlockService};
