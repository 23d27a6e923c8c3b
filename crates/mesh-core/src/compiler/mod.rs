//! Compiler/Deployer: validates a manifest, computes
//! per-activity consumes/produces, reserves symbol ranges, and materializes
//! schemas, transitions, hook patterns, subscriptions, and consumer-group
//! plans in the backend.

pub mod collator;
pub mod deploy;
pub mod ir;
pub mod mapping;
pub mod validator;

pub use deploy::{DeployResult, Deployer};
pub use ir::{ActivityIr, GraphIr, TransitionEdge};
