//! Core utilities shared by the vkframe crates.
//!
//! This crate provides foundational types and utilities:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - JSON configuration loading

pub mod config;
mod error;
mod logging;
mod timer;

pub use config::WindowConfig;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::{FrameCounter, Timer};
