//! carrel library crate.
//!
//! Offline content library backend: resumable archive downloads with
//! durable progress, and bounded in-memory reading sessions.

pub mod config;
pub mod database;
pub mod downloads;
pub mod error;
pub mod logging;
pub mod services;
pub mod sessions;

pub use error::{Error, Result};
