//! Configuration for the condor position lifecycle engine.
//!
//! Every numeric threshold the engine acts on — risk ceilings, exit and
//! roll triggers, polling cadence, fill timeouts — lives here and is
//! loadable from TOML, JSON, and environment variables. Nothing in the
//! engine hard-codes a threshold.

pub mod config;
pub mod config_loader;

pub use config::{
    AdvisoryConfig, AppConfig, EngineConfig, ExitConfig, RiskConfig, RollConfig,
};
pub use config_loader::ConfigLoader;
