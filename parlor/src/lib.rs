//! `Parlor`: concurrent core of a multi-user terminal chat room.
//!
//! The crate is organised leaves first:
//! - [`set`]: keyed concurrent store with lazily-expiring entries
//! - [`auth`] and [`key`]: admission state (bans, whitelist, operators)
//! - [`message`] and [`theme`]: message variants and per-viewer rendering
//! - [`history`]: bounded backlog of room-visible messages
//! - [`user`]: per-connection identity, configuration, and delivery queue
//! - [`command`] and [`builtin`]: command registry and the built-in table
//! - [`room`]: membership, the single broadcast consumer, and dispatch
//! - [`conn`] and [`host`]: transport-facing interfaces and the session driver

pub mod auth;
pub mod builtin;
pub mod command;
pub mod conn;
pub mod history;
pub mod host;
pub mod key;
pub mod message;
pub mod room;
pub mod set;
pub mod theme;
pub mod user;
