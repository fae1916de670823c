//! Lattice Mesh control plane
//!
//! Three cooperating processes — a Discovery Registry, a Health Monitor,
//! and an API Gateway — share an external Consul-compatible catalog and
//! optionally publish domain events to a message bus.

pub mod balancer;
pub mod catalog;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod messaging;
pub mod monitor;

pub use error::{AppError, Result};
