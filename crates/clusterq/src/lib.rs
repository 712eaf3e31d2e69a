#![deny(clippy::await_holding_refcell_ref)]

pub mod client;
pub mod common;
pub mod config;
pub mod manager;
pub mod submit;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::ClusterqError;
pub type Result<T> = std::result::Result<T, Error>;

/// Ordered maps keep generated scripts and remote argument vectors deterministic.
pub type Map<K, V> = std::collections::BTreeMap<K, V>;
pub type Set<T> = std::collections::BTreeSet<T>;

pub const CLUSTERQ_VERSION: &str = env!("CARGO_PKG_VERSION");
