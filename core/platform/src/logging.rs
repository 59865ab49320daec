use std::env;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};
use uuid::Uuid;

/// Span field carrying the request correlation id.
pub const CORRELATION_ID_FIELD: &str = "correlation_id";

/// Initialize structured logging for a service.
///
/// Production and staging emit JSON lines; development uses the plain text
/// formatter. The filter honours `RUST_LOG` and defaults to `info`.
pub fn init_logging(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let environment = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

    if environment == "prod" || environment == "staging" {
        let json_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish()
            .init();
    }

    tracing::info!(
        service = %service_name,
        environment = %environment,
        "logging initialized"
    );
}

/// Use the caller-supplied correlation id or mint a fresh one.
pub fn ensure_correlation_id(existing_id: Option<Uuid>) -> Uuid {
    existing_id.unwrap_or_else(Uuid::new_v4)
}
