//! # tb_app
//!
//! Shared utilities for applications embedding a keyed rate limiter

pub mod cli;
pub mod config_loader;
pub mod gate;
pub mod tracing_setup;
