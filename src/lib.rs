//! Update Engine library.
//!
//! A Docker container fleet update engine: an Image-Version Watcher polls
//! registries for digest drift, an Update Executor drives each update
//! through a rollback-capable state machine, and a Scheduler coordinates
//! manual, automatic, cron, and bulk triggers over a shared worker pool.
//! `engine::Engine` is the composition root; everything else is usable on
//! its own behind the `Gateway`/`RuntimeAdapter`/`AutoEnqueuer` traits.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod watcher;

pub use config::Configuration;
pub use engine::Engine;
pub use error::{EngineError, ErrorKind, Result};
pub use events::EventBus;
