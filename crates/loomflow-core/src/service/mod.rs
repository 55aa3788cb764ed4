//! Service-level abstractions shared by the engine.

pub mod hash;
