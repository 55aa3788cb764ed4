//! Workflow engine and repository trait definitions for Loomflow.
//!
//! This crate defines the "ports" (repository traits, work capabilities) that
//! the infrastructure layer implements, and the orchestration engine built on
//! them. It depends only on `loomflow-types` -- never on `loomflow-infra` or
//! any database/IO crate.

pub mod event;
pub mod repository;
pub mod service;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
