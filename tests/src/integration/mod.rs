//! # Integration Tests
//!
//! Flows that cross the session, gateway, channel, store and mutation
//! components, plus end-to-end runs of the network adapters.

pub mod adapters;
pub mod scenarios;
