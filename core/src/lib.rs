extern crate self as prosper_core;

pub mod log;
pub mod triggers;
