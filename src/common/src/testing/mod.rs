//! Test utilities for podttl.
//!
//! This module provides builders for test configurations and resource
//! snapshots.
//!
//! # Feature Flag
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testing::{SnapshotBuilder, TestConfigBuilder};
//!
//! let config = TestConfigBuilder::new().with_concurrency(8).build();
//! let pod = SnapshotBuilder::new("default", "web-0")
//!     .with_ttl("30")
//!     .ready_at(chrono::Utc::now())
//!     .build();
//! ```

mod config_builder;
mod snapshot_builder;

pub use config_builder::TestConfigBuilder;
pub use snapshot_builder::SnapshotBuilder;
