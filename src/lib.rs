//! # review-lease
//!
//! Leasing and decision engine for concurrent image review over a shared
//! SQLite store.
//!
//! Workers lease batches of reviews, record decisions, and the engine
//! closes whole devices as soon as a finalization rule fires. The store
//! file is the only coordination point between worker processes.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod storage;
pub mod telemetry;

pub use engine::{Engine, EngineOptions};
pub use error::{Error, Result};
