//! meshbus node - configuration and in-process cluster commands behind the
//! `meshbus` binary.

pub mod commands;
pub mod config;

pub use commands::{run_request, run_topology};
pub use config::NodeConfig;
