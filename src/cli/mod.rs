//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Streaming text generation
//! - Model listing, loading and concurrency inspection

pub mod commands;
pub mod handlers;

pub use handlers::{handle_generate, handle_model};
