//! Test doubles for the relay workspace.
//!
//! [`MemoryBus`] implements the full `Bus` trait in-process so component
//! and integration tests run without a live bus.  [`fixtures`] builds
//! producer event JSON in each of the accepted envelope shapes.

mod memory_bus;

pub mod fixtures;

pub use memory_bus::MemoryBus;
