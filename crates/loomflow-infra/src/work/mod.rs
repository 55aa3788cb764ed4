//! Work function adapters.
//!
//! Steps and phases call out to external work functions over HTTP. The engine
//! only sees the `StepWork` / `PhaseWork` capabilities from `loomflow-core`;
//! this module maps transport and status failures onto the engine's error
//! classes.

pub mod http;
