//! Configuration loading (spec §6 "Configuration").

mod config;

pub use config::*;
