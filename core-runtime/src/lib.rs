//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure shared by the streaming cache
//! crates:
//! - Logging and tracing infrastructure
//! - Event bus system
//!
//! ## Overview
//!
//! This crate establishes the logging conventions and event broadcasting
//! mechanisms used throughout the workspace. It has no knowledge of chunks or
//! HTTP; `core-playback` publishes into it.

pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
