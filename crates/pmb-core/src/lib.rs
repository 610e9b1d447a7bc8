//! Core domain + application logic for the personal messaging bot.
//!
//! This crate is intentionally transport-agnostic. The chat transport and the
//! reply model live behind ports (traits) implemented in adapter crates.

pub mod commands;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod errors;
pub mod guard;
pub mod logging;
pub mod pipeline;
pub mod reply;
pub mod session;
pub mod state;
pub mod store;
pub mod timer;
pub mod transport;
pub mod utils;

pub use errors::{Error, Result};
