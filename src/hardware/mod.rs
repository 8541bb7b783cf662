//! Positioner hardware.
//!
//! - [`qpt`]: QPT pan/tilt positioner protocol, driver and controller task
//! - [`mock`]: frame-accurate simulated positioner for tests and dry runs

pub mod mock;
pub mod qpt;
