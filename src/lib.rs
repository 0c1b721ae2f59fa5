#![forbid(unsafe_code)]

//! Video asset service: byte-range streaming, cascading deletion, a
//! favorites ledger kept consistent with the per-video like counters and
//! batch operations over the caller's videos.
//!
//! The `backend` binary serves the HTTP API from [`api`]; the `sweep`
//! binary reconciles the upload directory with the database.

pub mod api;
pub mod batch;
pub mod cascade;
pub mod config;
pub mod error;
pub mod favorites;
pub mod logging;
pub mod marks;
pub mod model;
pub mod range;
pub mod security;
pub mod storage;
pub mod store;
pub mod streaming;
pub mod videos;
pub mod views;
