//! # Client Sync Test Suite
//!
//! Unified test crate containing:
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── scenarios.rs   # Cross-component flows over the in-memory mocks
//!     └── adapters.rs    # reqwest / tungstenite adapters against a local axum server
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p sync-tests
//!
//! # By category
//! cargo test -p sync-tests integration::scenarios::
//! cargo test -p sync-tests integration::adapters::
//! ```

pub mod integration;
