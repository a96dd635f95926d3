//! # clip-core
//!
//! Core types, traits, and utilities for Clip RS.
//!
//! This crate provides the building blocks shared by the attachment crates:
//! - Common error types
//! - Owner capability traits (identity, processing deferral)
//! - A time source abstraction
//! - Configuration types
//! - The circuit breaker guarding calls to object storage

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod traits;

pub use circuit_breaker::{
    BreakerFailure, CircuitBreaker, CircuitBreakerRegistry, CircuitState, CircuitStats,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, CircuitConfig, StorageConfig};
pub use error::*;
pub use traits::*;
