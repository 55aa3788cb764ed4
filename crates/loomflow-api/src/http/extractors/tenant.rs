//! Tenant scoping extractor.
//!
//! Every run route requires an `X-Tenant-Id` header. Runs owned by another
//! tenant are reported as not found by the coordinator.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::http::error::AppError;
use crate::state::AppState;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// The tenant a request acts for.
#[derive(Debug, Clone)]
pub struct Tenant(pub String);

impl FromRequestParts<AppState> for Tenant {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        tenant_from_parts(parts).map(Tenant)
    }
}

fn tenant_from_parts(parts: &Parts) -> Result<String, AppError> {
    let value = parts.headers.get(TENANT_HEADER).ok_or_else(|| {
        AppError::Validation("Missing tenant. Provide it via the 'X-Tenant-Id' header.".to_string())
    })?;
    let tenant = value
        .to_str()
        .map_err(|_| AppError::Validation("Invalid X-Tenant-Id header encoding".to_string()))?
        .trim();
    if tenant.is_empty() {
        return Err(AppError::Validation("X-Tenant-Id must not be empty".to_string()));
    }
    Ok(tenant.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/v1/runs");
        if let Some(value) = header {
            builder = builder.header("X-Tenant-Id", value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_tenant_is_trimmed() {
        assert_eq!(tenant_from_parts(&parts(Some(" acme "))).unwrap(), "acme");
    }

    #[test]
    fn test_missing_or_blank_tenant_is_rejected() {
        assert!(matches!(tenant_from_parts(&parts(None)), Err(AppError::Validation(_))));
        assert!(matches!(tenant_from_parts(&parts(Some("  "))), Err(AppError::Validation(_))));
    }
}
