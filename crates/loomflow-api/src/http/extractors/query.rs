//! Query parameter extractors for list endpoints.

use serde::Deserialize;

/// Upper bound for a single run listing.
pub const MAX_RUN_LIMIT: u32 = 200;

/// Query parameters for the run list endpoint.
#[derive(Debug, Deserialize)]
pub struct RunListQuery {
    /// Maximum results (default 20, capped at 200).
    #[serde(default = "default_run_limit")]
    pub limit: u32,
}

fn default_run_limit() -> u32 {
    20
}

impl RunListQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_RUN_LIMIT)
    }
}
