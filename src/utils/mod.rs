//! # Utility Modules
//!
//! Supporting utilities for logging and timing.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Timeout constants and async timeout wrappers

pub mod logging;
pub mod timeout;
