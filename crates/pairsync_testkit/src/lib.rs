//! # pairsync Testkit
//!
//! Test utilities for pairsync.
//!
//! This crate provides:
//! - Record builders and temporary directory fixtures
//! - Property-based generators for records and delivery schedules
//! - A producer/consumer harness wired over an in-process link
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pairsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn converges() {
//!     let harness = PairHarness::manual();
//!     harness.relay().save_and_enqueue(&RecordBuilder::new(1).build()).await.unwrap();
//!     assert!(harness.settle().await);
//!     assert!(harness.is_converged());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use pairsync_engine::SyncConfig;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
