use crate::errors::PlatformError;
use crate::logging;
use std::env;
use tracing::{info, info_span, Span};
use uuid::Uuid;

/// Initialize tracing for the given service and emit the startup event.
pub fn init_tracing(service_name: &str) -> Result<(), PlatformError> {
    logging::init_logging(service_name);

    let environment = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

    info!(
        service = %service_name,
        environment = %environment,
        event = "startup",
        "tracing initialized"
    );

    Ok(())
}

/// Span joining all log lines of one request-scoped operation.
pub fn correlation_span(correlation_id: Uuid, operation: &str) -> Span {
    info_span!(
        "operation",
        %operation,
        correlation_id = %correlation_id,
    )
}

/// Extract the correlation id from a request, minting one when absent.
pub fn extract_correlation_id(existing_id: Option<Uuid>) -> Uuid {
    logging::ensure_correlation_id(existing_id)
}
