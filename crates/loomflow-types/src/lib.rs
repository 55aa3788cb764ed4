//! Shared domain types for Loomflow.
//!
//! This crate contains the domain types used across the Loomflow workflow
//! engine: pipelines and run plans, runs, steps and attempts, artifacts,
//! approval gates, sub-workflow phases, run events and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod approval;
pub mod artifact;
pub mod config;
pub mod error;
pub mod event;
pub mod phase;
pub mod pipeline;
pub mod run;
