//! Reading session management.
//!
//! Open tabs hold expensive live state that cannot all stay resident. The
//! registry bounds how many sessions exist at once and persists the rest,
//! so tabs survive eviction, restart, and low-memory pressure.

mod registry;

pub use registry::{SessionRegistry, TabSession};
