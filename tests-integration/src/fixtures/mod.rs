//! Test fixtures for integration testing
//!
//! This module provides a reusable context that runs a TTL controller
//! against an in-memory resource store.

mod controller_context;

pub use controller_context::ControllerTestContext;
