//! HTTP request handlers for the REST API.

pub mod pipeline;
pub mod run;
pub mod ws;
