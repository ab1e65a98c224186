//! Database models for carrel.
//!
//! These models map directly to the database schema; status strings and
//! JSON session snapshots are parsed at the call sites that need them.

pub mod archive;
pub mod tab;

pub use archive::*;
pub use tab::*;
