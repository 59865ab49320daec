//! HTTP endpoints: agent operations, chat (plain and SSE), config, and
//! session management. Every response body is JSON; streaming endpoints
//! speak `text/event-stream`.

use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use serde_json::json;
use tracing::{error, info, Instrument};

use platform::{correlation_span, extract_correlation_id, record_counter};
use shared_types::{
    ApiErrorBody, ChatRequest, ChatResponse, ChatStreamFrame, HealthResponse, PlanRequest,
    RefineRequest, ReplanRequest, ReportExecutionRequest, ValidateRequest, VerifyStateRequest,
};

use super::{validation, ApiContext};
use crate::agent::AgentService;
use crate::config_service::AppConfig;
use crate::error::AgentServerError;

pub fn configure(cfg: &mut web::ServiceConfig, ctx: ApiContext) {
    cfg.app_data(web::Data::new(ctx))
        .route("/health", web::get().to(health))
        .route("/config", web::get().to(get_config))
        .route("/config", web::post().to(post_config))
        .route("/agent/plan", web::post().to(agent_plan))
        .route("/agent/plan/stream", web::post().to(agent_plan_stream))
        .route("/agent/refine", web::post().to(agent_refine))
        .route("/agent/replan", web::post().to(agent_replan))
        .route("/agent/validate", web::post().to(agent_validate))
        .route("/agent/reflect", web::post().to(agent_reflect))
        .route("/agent/verify-state", web::post().to(agent_verify_state))
        .route(
            "/agent/report-execution",
            web::post().to(agent_report_execution),
        )
        .route("/chat/message", web::post().to(chat_message))
        .route("/chat/stream", web::post().to(chat_stream))
        .route("/sessions", web::get().to(list_sessions))
        .route("/sessions/{id}", web::delete().to(delete_session));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn get_config(ctx: web::Data<ApiContext>) -> HttpResponse {
    HttpResponse::Ok().json(ctx.config.masked())
}

async fn post_config(
    ctx: web::Data<ApiContext>,
    body: web::Json<AppConfig>,
) -> Result<HttpResponse, AgentServerError> {
    let applied = ctx
        .config
        .update(body.into_inner())
        .map_err(AgentServerError::Internal)?;
    info!(provider = %applied.llm.default_provider, "configuration updated");

    // Echo the stored config back, masked like GET.
    Ok(HttpResponse::Ok().json(ctx.config.masked()))
}

async fn agent_plan(
    ctx: web::Data<ApiContext>,
    body: web::Json<PlanRequest>,
) -> Result<HttpResponse, AgentServerError> {
    let req = body.into_inner();
    let correlation_id = extract_correlation_id(req.correlation_id);
    let span = correlation_span(correlation_id, "agent_plan");

    async move {
        record_counter("http_requests_total_agent_plan", 1);
        validation::require_text("request", &req.request)?;

        let response = ctx.agent.plan(&req).await?;
        info!(steps = response.plan.total_steps, "plan produced");
        Ok(HttpResponse::Ok().json(response))
    }
    .instrument(span)
    .await
}

fn sse_frame(value: &serde_json::Value) -> web::Bytes {
    web::Bytes::from(format!("data: {value}\n\n"))
}

fn sse_response(
    stream: impl futures_util::Stream<Item = Result<web::Bytes, actix_web::Error>> + 'static,
) -> HttpResponse {
    HttpResponse::Ok()
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

async fn agent_plan_stream(
    ctx: web::Data<ApiContext>,
    body: web::Json<PlanRequest>,
) -> Result<HttpResponse, AgentServerError> {
    let req = body.into_inner();
    record_counter("http_requests_total_agent_plan_stream", 1);

    let prompt = ctx.agent.plan_prompt(&req)?;
    let mut deltas = ctx.agent.chat_stream(&prompt, None).await?;

    let stream = async_stream::stream! {
        yield Ok::<_, actix_web::Error>(sse_frame(&json!({
            "phase": "planning",
            "message": "generating execution plan",
        })));

        let mut accumulated = String::new();
        while let Some(delta) = deltas.next().await {
            match delta {
                Ok(chunk) => {
                    accumulated.push_str(&chunk);
                    yield Ok(sse_frame(&json!({"reasoning": chunk})));
                }
                Err(e) => {
                    error!(error = %e, "plan stream interrupted");
                    yield Ok(sse_frame(&json!({"error": e.to_string(), "done": true})));
                    return;
                }
            }
        }

        match AgentService::plan_from_stream_text(&accumulated) {
            Ok((plan, _)) => {
                yield Ok(sse_frame(&json!({"plan": plan, "done": true})));
            }
            Err(e) => {
                yield Ok(sse_frame(&json!({"error": e.to_string(), "done": true})));
            }
        }
    };

    Ok(sse_response(stream))
}

async fn agent_refine(
    ctx: web::Data<ApiContext>,
    body: web::Json<RefineRequest>,
) -> Result<HttpResponse, AgentServerError> {
    record_counter("http_requests_total_agent_refine", 1);
    let req = body.into_inner();
    validation::require_text("error.kind", &req.error.kind)?;

    let response = ctx.agent.refine(&req).await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn agent_replan(
    ctx: web::Data<ApiContext>,
    body: web::Json<ReplanRequest>,
) -> Result<HttpResponse, AgentServerError> {
    record_counter("http_requests_total_agent_replan", 1);
    let req = body.into_inner();
    validation::require_text("originalRequest", &req.original_request)?;

    let response = ctx.agent.replan(&req).await?;
    info!(decision = ?response.decision, used_llm = response.used_llm, "replan decided");
    Ok(HttpResponse::Ok().json(response))
}

async fn agent_validate(
    ctx: web::Data<ApiContext>,
    body: web::Json<ValidateRequest>,
) -> Result<HttpResponse, AgentServerError> {
    record_counter("http_requests_total_agent_validate", 1);
    let req = body.into_inner();
    validation::require_text("code", &req.code)?;

    Ok(HttpResponse::Ok().json(ctx.agent.validate(&req)))
}

async fn agent_reflect(
    ctx: web::Data<ApiContext>,
    body: web::Json<shared_types::ReflectRequest>,
) -> Result<HttpResponse, AgentServerError> {
    record_counter("http_requests_total_agent_reflect", 1);
    let evaluation = ctx.agent.reflect(&body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(evaluation))
}

async fn agent_verify_state(
    ctx: web::Data<ApiContext>,
    body: web::Json<VerifyStateRequest>,
) -> Result<HttpResponse, AgentServerError> {
    record_counter("http_requests_total_agent_verify_state", 1);
    Ok(HttpResponse::Ok().json(ctx.agent.verify_state(&body.into_inner())))
}

async fn agent_report_execution(
    ctx: web::Data<ApiContext>,
    body: web::Json<ReportExecutionRequest>,
) -> Result<HttpResponse, AgentServerError> {
    record_counter("http_requests_total_agent_report_execution", 1);
    let req = body.into_inner();
    validation::require_session_id(&req.session_id)?;

    let response = ctx.agent.report_execution(&req).await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn chat_message(
    ctx: web::Data<ApiContext>,
    body: web::Json<ChatRequest>,
) -> Result<HttpResponse, AgentServerError> {
    record_counter("http_requests_total_chat_message", 1);
    let req = body.into_inner();
    validation::require_text("message", &req.message)?;

    let session = ctx.sessions.get_or_create(req.conversation_id.as_deref());
    let history = ctx.sessions.recent(&session.id, 20);
    let context = ctx.agent.chat_context(&history).await;

    let (response, model) = ctx.agent.chat(&req.message, context.as_deref()).await?;
    ctx.sessions
        .store_exchange(&session.id, &req.message, &response);

    Ok(HttpResponse::Ok().json(ChatResponse {
        response,
        conversation_id: session.id,
        model,
    }))
}

async fn chat_stream(
    ctx: web::Data<ApiContext>,
    body: web::Json<ChatRequest>,
) -> Result<HttpResponse, AgentServerError> {
    record_counter("http_requests_total_chat_stream", 1);
    let req = body.into_inner();
    validation::require_text("message", &req.message)?;

    let session = ctx.sessions.get_or_create(req.conversation_id.as_deref());
    let history = ctx.sessions.recent(&session.id, 20);
    let context = ctx.agent.chat_context(&history).await;

    let mut deltas = ctx.agent.chat_stream(&req.message, context.as_deref()).await?;

    let sessions = ctx.sessions.clone();
    let session_id = session.id.clone();
    let message = req.message.clone();

    let stream = async_stream::stream! {
        let mut full_response = String::new();

        while let Some(delta) = deltas.next().await {
            match delta {
                Ok(chunk) => {
                    full_response.push_str(&chunk);
                    let frame = ChatStreamFrame {
                        content: chunk,
                        done: false,
                        conversation_id: None,
                        error: None,
                    };
                    yield Ok::<_, actix_web::Error>(sse_frame(
                        &serde_json::to_value(&frame).unwrap_or_default(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "chat stream interrupted");
                    yield Ok(sse_frame(&json!({"error": e.to_string(), "done": true})));
                    return;
                }
            }
        }

        sessions.store_exchange(&session_id, &message, &full_response);

        let final_frame = ChatStreamFrame {
            content: String::new(),
            done: true,
            conversation_id: Some(session_id.clone()),
            error: None,
        };
        yield Ok(sse_frame(&serde_json::to_value(&final_frame).unwrap_or_default()));
    };

    Ok(sse_response(stream))
}

async fn list_sessions(ctx: web::Data<ApiContext>) -> HttpResponse {
    HttpResponse::Ok().json(json!({"sessions": ctx.sessions.list()}))
}

async fn delete_session(
    ctx: web::Data<ApiContext>,
    path: web::Path<String>,
) -> Result<HttpResponse, AgentServerError> {
    let id = path.into_inner();
    if !ctx.sessions.delete(&id) {
        return Err(AgentServerError::NotFound(format!(
            "session '{id}' does not exist"
        )));
    }
    Ok(HttpResponse::Ok().json(json!({"deleted": id})))
}

/// JSON body rejections also answer with the `{error, status}` shape.
pub fn json_error_handler(
    err: actix_web::error::JsonPayloadError,
    _req: &actix_web::HttpRequest,
) -> actix_web::Error {
    let body = ApiErrorBody {
        error: format!("invalid JSON payload: {err}"),
        status: 400,
    };
    actix_web::error::InternalError::from_response(
        err,
        HttpResponse::BadRequest().json(body),
    )
    .into()
}
