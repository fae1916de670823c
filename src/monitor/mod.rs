//! Health Monitor - probe engine, per-instance circuit breakers, result cache

pub mod api;
pub mod breaker;
pub mod cache;
pub mod worker;

pub use breaker::{BreakerState, CircuitBreaker};
pub use cache::{MonitoredInstance, ProbeType, StatusCache};
pub use worker::Worker;
