//! Core library for the farfield_daq application.
//!
//! Drives an antenna far-field measurement: a QPT pan/tilt positioner on a
//! serial line and an HP 8753D network analyzer on GPIB, sequenced by a sweep
//! state machine that writes S-parameter samples to CSV.
//!
//! - [`hardware`]: positioner wire protocol, driver and controller task
//! - [`instrument`]: analyzer command tables and measurement session
//! - [`experiment`]: sweep configuration, timing and state machine
//! - [`measurement`]: samples and output sinks
//! - [`adapters`]: serial and VISA transports
//! - [`config`], [`logging`], [`error`], [`messages`]: the ambient plumbing

pub mod adapters;
pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod messages;
