//! # Connections Module
//!
//! This module handles persistent connections to external services. The
//! campaign pipeline only talks to one: the message bus broker.

/// Redis pub/sub transport for the campaign event bus.
pub mod redis_bus;

pub use redis_bus::RedisBus;
