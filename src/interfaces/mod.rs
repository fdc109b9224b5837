//! Marshalling between the command-line surface and the engine.

pub mod csv;
pub mod dispatch;
pub mod output;
