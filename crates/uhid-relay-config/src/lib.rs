//! Configuration parsing for uhid-relay
//!
//! This crate handles parsing the optional KDL configuration file shared by
//! the relay daemon and the CLI.

mod error;
mod model;
mod parser;

pub use error::ConfigError;
pub use model::*;
pub use parser::{parse_config, parse_config_str};
