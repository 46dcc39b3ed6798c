//! ---
//! hive_section: "01-core-functionality"
//! hive_subsection: "module"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Shared primitives and utilities for Hive components."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
//! Shared primitives for the Hive workspace.
//! This crate exposes configuration-file loading and tracing initialisation
//! consumed by the bus library and the operator tooling.

pub mod config;
pub mod logging;

pub use config::{load_with_source, LoadedConfig, LoggingConfig, Validate};
pub use logging::{init, init_tracing, LogFormat};
