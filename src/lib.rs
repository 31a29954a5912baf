//! Tollgate - Rate Limiting and Lifecycle Signals for gRPC Handlers
//!
//! This crate decorates gRPC method handlers with fixed-window rate limits
//! counted in a shared store, and reports the outcome of every call to
//! lifecycle signal subscribers.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod signals;
