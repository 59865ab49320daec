use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use shared_types::ApiErrorBody;
use thiserror::Error;

use crate::llm::LlmError;

/// Server-level failures, each mapped onto one HTTP status.
#[derive(Debug, Error)]
pub enum AgentServerError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("upstream LLM unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream LLM timed out: {0}")]
    UpstreamTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, AgentServerError>;

impl From<LlmError> for AgentServerError {
    fn from(err: LlmError) -> Self {
        match &err {
            LlmError::Timeout { .. } => AgentServerError::UpstreamTimeout(err.to_string()),
            LlmError::RateLimited { .. } | LlmError::Network(_) => {
                AgentServerError::UpstreamUnavailable(err.to_string())
            }
            LlmError::Api { status, .. } if *status >= 500 => {
                AgentServerError::UpstreamUnavailable(err.to_string())
            }
            LlmError::Auth(_) | LlmError::NotConfigured(_) => {
                AgentServerError::InvalidInput(err.to_string())
            }
            _ => AgentServerError::Internal(err.to_string()),
        }
    }
}

impl ResponseError for AgentServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            AgentServerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AgentServerError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentServerError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AgentServerError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AgentServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        HttpResponse::build(status).json(ApiErrorBody {
            error: self.to_string(),
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_errors_map_to_gateway_statuses() {
        let unavailable: AgentServerError = LlmError::RateLimited {
            provider: "gemini",
            message: "quota".into(),
        }
        .into();
        assert_eq!(unavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let timeout: AgentServerError = LlmError::Timeout { provider: "openai" }.into();
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);

        let auth: AgentServerError = LlmError::Auth("bad key".into()).into();
        assert_eq!(auth.status_code(), StatusCode::BAD_REQUEST);

        let server_side: AgentServerError = LlmError::Api {
            provider: "vllm",
            status: 502,
            message: "bad gateway".into(),
        }
        .into();
        assert_eq!(server_side.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
