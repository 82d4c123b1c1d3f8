//! OpenAPI Documentation
//!
//! Generated OpenAPI 3.0 document for the transfer gateway, served at
//! `/api-docs/openapi.json`.

use utoipa::OpenApi;

use crate::gateway::handlers::HealthResponse;
use crate::gateway::types::{
    CancelBody, CancelResponse, CompensationStatsView, CompensationView, ErrorBody, TransferBody,
    TransferResponse, TransferStatusResponse,
};

/// Main API Documentation struct
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Transfer Saga API",
        version = "1.0.0",
        description = "Account-to-account money transfers executed as durable sagas with audited compensation.",
        license(
            name = "MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::transfer::create_transfer,
        crate::gateway::handlers::transfer::get_transfer,
        crate::gateway::handlers::transfer::cancel_transfer,
        crate::gateway::handlers::health::health_check,
        crate::gateway::handlers::health::metrics,
        crate::gateway::handlers::compensation::list_pending,
        crate::gateway::handlers::compensation::get_stats,
    ),
    components(
        schemas(
            TransferBody,
            TransferResponse,
            TransferStatusResponse,
            CancelBody,
            CancelResponse,
            CompensationView,
            CompensationStatsView,
            HealthResponse,
            ErrorBody,
        )
    ),
    tags(
        (name = "Transfer", description = "Execute, query and cancel transfers"),
        (name = "Operations", description = "Compensation audit views"),
        (name = "System", description = "Health checks and metrics")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use utoipa::OpenApi;

    #[test]
    fn test_openapi_spec_generates() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "Transfer Saga API");
        assert_eq!(spec.info.version, "1.0.0");
    }

    #[test]
    fn test_openapi_json_serializable() {
        let json = ApiDoc::openapi().to_json();
        assert!(json.is_ok());
        assert!(json.unwrap().contains("Transfer Saga API"));
    }

    #[test]
    fn test_endpoints_registered() {
        let paths = ApiDoc::openapi().paths;
        assert!(paths.paths.contains_key("/transfer"));
        assert!(paths.paths.contains_key("/transfer/{transaction_id}"));
        assert!(paths.paths.contains_key("/transfer/{transaction_id}/cancel"));
        assert!(paths.paths.contains_key("/health"));
        assert!(paths.paths.contains_key("/metrics"));
        assert!(paths.paths.contains_key("/compensations/pending"));
        assert!(paths.paths.contains_key("/compensations/stats"));
    }

    #[test]
    fn test_error_schema_registered() {
        let components = ApiDoc::openapi().components.expect("should have components");
        assert!(components.schemas.contains_key("ErrorBody"));
        assert!(components.schemas.contains_key("TransferBody"));
    }
}
