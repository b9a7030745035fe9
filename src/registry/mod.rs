//! Registry Client (C1).

pub mod auth;
pub mod cache;
pub mod client;

pub use cache::DigestCache;
pub use client::{RegistryClient, ResolvedImage};
