//! Marketsync
//!
//! Pulls transactional and reporting data from marketplace provider APIs on
//! behalf of many client accounts and writes it, reconciled and idempotently,
//! into a relational store.
//!
//! # Modules
//!
//! - `transport`: HTTP engine with per-provider auth, retry and rate limiting
//! - `pagination`: lazy record streams over paginated endpoints
//! - `jobs`: asynchronous report jobs (submit, poll, fetch)
//! - `reconcile`: business-key grouping and field merging
//! - `db`: pool, schema, idempotent upserts and the run ledger
//! - `sync`: per-client orchestration of independent entity units
//! - `catalog`: config-driven providers, entities and clients

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod pagination;
pub mod reconcile;
pub mod routes;
pub mod state;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod test_support;
