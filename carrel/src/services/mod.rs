//! Service layer module.
//!
//! Provides the service container that wires the database pools,
//! repositories, transport, and application services together.

pub mod container;

pub use container::ServiceContainer;
