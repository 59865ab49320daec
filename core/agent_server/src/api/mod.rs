use actix_web::web;
use std::sync::Arc;

use crate::agent::AgentService;
use crate::config_service::ConfigService;
use crate::session_service::SessionService;

pub mod http;
pub mod validation;

/// Shared handles passed to every HTTP handler.
#[derive(Clone)]
pub struct ApiContext {
    pub agent: Arc<AgentService>,
    pub sessions: Arc<SessionService>,
    pub config: Arc<ConfigService>,
    /// Current application environment (dev, staging, prod).
    pub app_env: String,
}

pub fn configure_http(cfg: &mut web::ServiceConfig, ctx: ApiContext) {
    http::configure(cfg, ctx);
}
