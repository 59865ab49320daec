use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{http::header, web, App, HttpServer};
use tracing::{error, info, warn};

use agent_server::agent::AgentService;
use agent_server::api::{self, ApiContext};
use agent_server::config_service::ConfigService;
use agent_server::session_service::SessionService;

fn run_http_server(
    api_ctx: ApiContext,
    bind_addr: &str,
) -> std::io::Result<actix_web::dev::Server> {
    let ctx = api_ctx.clone();

    let server = HttpServer::new(move || {
        // The notebook front-end runs on its own origin in development.
        let cors = if ctx.app_env == "prod" {
            Cors::default()
                .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
                .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
                .max_age(3600)
        } else {
            Cors::default()
                .allow_any_origin()
                .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
                .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
                .max_age(3600)
        };

        let ctx_clone = ctx.clone();

        App::new()
            // Plans carry full cell sources; the default 2MB limit is too
            // small for large notebook payloads.
            .app_data(
                web::JsonConfig::default()
                    .limit(50 * 1024 * 1024)
                    .error_handler(api::http::json_error_handler),
            )
            .configure(|cfg| api::configure_http(cfg, ctx_clone))
            .wrap(cors)
    })
    .bind(bind_addr)?
    .run();

    Ok(server)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    platform::init_tracing("agent_server").expect("failed to init tracing");

    let metrics_addr = env::var("METRICS_ADDR").unwrap_or_else(|_| "127.0.0.1:9090".to_string());
    match metrics_addr.parse() {
        Ok(addr) => {
            if let Err(e) = platform::init_metrics(addr) {
                warn!(addr = %metrics_addr, error = %e, "metrics exporter disabled");
            } else {
                info!(addr = %metrics_addr, "metrics exporter listening");
            }
        }
        Err(e) => warn!(addr = %metrics_addr, error = %e, "invalid METRICS_ADDR, metrics disabled"),
    }

    let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());
    let config_path =
        PathBuf::from(env::var("CONFIG_PATH").unwrap_or_else(|_| "data/config.toml".to_string()));

    let config = Arc::new(ConfigService::load(config_path, &app_env));
    let app_config = config.get();
    info!(
        provider = %app_config.llm.default_provider,
        env = %app_env,
        "configuration active"
    );

    let sessions = Arc::new(SessionService::new(PathBuf::from(
        &app_config.session.storage_path,
    )));

    let agent = match AgentService::new(config.clone()) {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            error!(error = %e, "failed to initialize the agent service");
            return Ok(());
        }
    };

    let api_ctx = ApiContext {
        agent,
        sessions: sessions.clone(),
        config,
        app_env,
    };

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8890".to_string());
    info!(addr = %bind_addr, "starting agent server");

    let server = run_http_server(api_ctx, &bind_addr)?;
    let handle = server.handle();

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C handler");
            return;
        }
        info!("shutdown signal received");
        handle.stop(true).await;
    };

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {
            info!("graceful shutdown complete");
        }
    }

    // Flush session state before the process exits.
    sessions.save();

    Ok(())
}
