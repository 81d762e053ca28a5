//! # Verdant Testkit
//!
//! Test utilities for the Verdant client sync core.
//!
//! This crate provides:
//! - [`FakeBackend`]: an in-process server implementing every port, with
//!   scripted failures and a push channel driver
//! - Fixtures for posts, configurations and signed-in sessions
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use verdant_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn like_is_confirmed() {
//!     let session = TestSession::start(sample_posts()).await;
//!     session.client.like(&PostId::new("p1")).unwrap();
//!     assert!(eventually(|| session.client.queue().is_empty()).await);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use backend::*;
pub use fixtures::*;
pub use generators::*;
