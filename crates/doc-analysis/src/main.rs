mod chunker;
mod classify;
mod config;
mod error;
mod llm;
mod model;
mod orchestrator;
mod progressive;
mod prompt;
mod questions;
mod rate_limit;
mod screen;
mod server;
mod store;

use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};
use tracing::info;
use tracing_subscriber::EnvFilter;

use analysis_common::kv::{KvStore, MemoryStore, RedisStore};
use analysis_common::openai::OpenAiClient;

use config::Config;
use llm::OpenAiFunctionCaller;
use orchestrator::AnalysisOrchestrator;
use progressive::ProgressiveController;
use rate_limit::RateLimitManager;
use server::DocAnalysisServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting doc-analysis MCP server");

    let config = Config::from_env()?;
    info!(
        base_url = %config.openai.base_url,
        model = %config.model,
        timeout_ms = config.openai.default_timeout.as_millis(),
        max_retries = config.openai.max_retries,
        "openai client configured"
    );
    let client = OpenAiClient::new(config.openai.clone())?;
    let caller = Arc::new(OpenAiFunctionCaller::new(client, &config.model));

    let redis = RedisStore::new(config.redis_url.as_deref(), config.session_ttl);
    let kv: Arc<dyn KvStore> = if redis.is_available().await {
        info!(ttl_secs = redis.ttl().as_secs(), "redis connected, sessions are persisted");
        Arc::new(redis)
    } else {
        info!(
            ttl_secs = config.session_ttl.as_secs(),
            "redis unavailable, keeping sessions in memory"
        );
        Arc::new(MemoryStore::new(config.session_ttl))
    };

    let limiter = RateLimitManager::new(config.rate_limit.clone());
    info!(
        per_minute = limiter.config().requests_per_minute,
        per_day = limiter.config().requests_per_day,
        tokens_per_minute = ?limiter.config().tokens_per_minute,
        "rate limiter configured"
    );

    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        caller,
        limiter.clone(),
        config.orchestrator.clone(),
    ));
    let controller = ProgressiveController::new(orchestrator, kv.clone(), config.progressive.clone());
    let server = DocAnalysisServer::new(controller, limiter);

    info!(store = kv.backend(), "MCP server ready, serving on stdio");
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!(error = %e, "MCP server error");
    })?;

    service.waiting().await?;
    info!("MCP server shut down");
    Ok(())
}
