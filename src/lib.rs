//! Template-driven configuration state engine.
//!
//! Captures the state a template describes (files, registry keys, package
//! inventories, scheduled tasks) into a directory of state records, and
//! applies those records back onto a machine.
//!
//! The public API is organised into layers:
//!
//! - **[`locator`]**: canonical resource addresses and drive mapping
//! - **[`template`]**: loading, validation and inheritance of templates
//! - **[`resources`]**: per-kind providers, state records and the record store
//! - **[`engine`]**: the template executor and its run state machine
//! - **[`plan`]**: ordered template runs and external action steps
//! - **[`commands`]**: top-level subcommand orchestration
#![deny(clippy::or_fun_call)]
#![deny(clippy::bool_to_int_with_if)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod exec;
pub mod locator;
pub mod logging;
pub mod platform;
pub mod plan;
pub mod privilege;
pub mod resources;
pub mod template;
