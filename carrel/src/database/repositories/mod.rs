//! Repository layer for database access.
//!
//! All database interactions go through these traits so the download
//! controller and session registry can be tested against in-memory fakes.

pub mod archive;
pub mod session;

pub use archive::*;
pub use session::*;
