//! peerlink CLI library
//!
//! Command parsing, configuration and the in-process demo session behind the
//! `peerlink` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod demo;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::AppConfig;
pub use demo::{DemoReport, Exchange};
pub use error::{CliError, Result};
