//! Network analyzer control.
//!
//! - [`syntax`]: per-model command tables
//! - [`vna`]: the measurement session and trace decoding
//! - [`mock`]: simulated analyzer for tests and dry runs

pub mod mock;
pub mod syntax;
pub mod vna;

pub use syntax::{CommandSyntax, Hp8753d, Model};
pub use vna::{FrequencySpec, VnaSession, MAX_LIST_FREQUENCIES};
