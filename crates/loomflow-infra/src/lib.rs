//! Infrastructure layer for Loomflow.
//!
//! Contains implementations of the ports defined in `loomflow-core`: SQLite
//! run and artifact storage, SHA-256 content hashing, HTTP work adapters, and
//! the data-directory and `config.toml` loaders.

pub mod config;
pub mod crypto;
pub mod filesystem;
pub mod sqlite;
pub mod work;
