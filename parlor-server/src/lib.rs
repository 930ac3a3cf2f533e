//! Parlor server library.
//!
//! Exposes configuration, credential loading, and the TCP front end for
//! use in tests and embedding. The chat room itself lives in the `parlor`
//! crate.

pub mod config;
pub mod keys;
pub mod tcp;
