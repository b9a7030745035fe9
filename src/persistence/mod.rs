//! Persistence Gateway (C7).

pub mod gateway;
pub mod schema;
pub mod sqlite;

pub use gateway::{AvailableUpdateFilter, Gateway, JobFilter, Page};
pub use sqlite::{open_gateway, SqliteGateway};
