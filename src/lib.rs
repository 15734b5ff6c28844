//! Risk-control decision engine.
//!
//! Consumes exposure and session snapshots from durable streams, drives the
//! operating-mode state machine and publishes derisk, band-corrective and
//! trim intents for a downstream execution service.

pub mod arbiter;
pub mod band;
pub mod circuit;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod exit;
pub mod journal;
pub mod logging;
pub mod market;
pub mod model;
pub mod policy;
pub mod report;
pub mod retry;
pub mod runner;
pub mod signals;
pub mod storage;
pub mod stream;
pub mod trim;
