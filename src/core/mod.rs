//! Core modules for Cairn's replicated record store.
//!
//! Leaf primitives (time, tokens, file I/O, identity, locks) sit at the bottom; records and
//! histories build on them; `store` ties everything into the replication protocol.

pub mod change;
pub mod codec;
pub mod config;
pub mod error;
pub mod flag;
pub mod fsio;
pub mod history;
pub mod identity;
pub mod record;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod time;
pub mod token;
