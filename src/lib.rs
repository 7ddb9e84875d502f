//! # SwarmKV
//!
//! A distributed, Redis-compatible in-memory datastore built as a mesh of
//! small actors: one task per typed value, one per keyspace partition,
//! one per client connection, plus ephemeral aggregators for multi-key
//! commands. SwarmKV speaks RESP on the wire and implements the core
//! Redis data structures (strings, hashes, lists, sets, sorted sets,
//! bitmaps, HyperLogLogs) with key expiration, pub/sub, passivation of
//! idle values and snapshot-based durability.

pub mod aggregate;
pub mod commands;
pub mod config;
pub mod error;
pub mod glob;
pub mod keyspace;
pub mod nodes;
pub mod resp;
pub mod routing;
pub mod server;
pub mod session;
pub mod snapshot;
