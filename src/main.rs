use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;

use agent_jobs::agent::JobExecutor;
use agent_jobs::api::{ApiState, api_routes};
use agent_jobs::config::JobsConfig;
use agent_jobs::jobs::spawn_cron_ticker;
use agent_jobs::llm::create_provider;
use agent_jobs::store::{Database, LibSqlBackend};
use agent_jobs::stream::{MemoryStreamBackend, ProgressHub};
use agent_jobs::tools::ToolRegistry;
use agent_jobs::tools::builtin::CurrentTimeTool;
use agent_jobs::workflow::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = JobsConfig::from_env()?;
    let llm_config = config.llm_config()?;

    eprintln!("Agent Jobs v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Step ceiling: {}", config.max_steps);

    let llm = create_provider(&llm_config)?;

    // ── Database ────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Tools ───────────────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    tools.register_builtin(Arc::new(CurrentTimeTool)).await;
    eprintln!("   Tools: {} registered", tools.count().await);

    // ── Orchestrator ────────────────────────────────────────────────────
    let streams = ProgressHub::new(Arc::new(MemoryStreamBackend::new()));
    let executor = Arc::new(
        JobExecutor::new(llm, tools, streams.clone()).with_max_steps(config.max_steps),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        executor,
        streams,
        config.workflow_options(),
    ));

    // ── Startup Recovery: fail runs orphaned by a previous process ──────
    match orchestrator.recover_orphaned_runs(config.recover_after).await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Recovered {n} orphaned runs"),
        Err(e) => tracing::warn!(error = %e, "Orphaned run recovery failed"),
    }

    // ── Cron trigger ────────────────────────────────────────────────────
    let _cron_handle = match config.cron_interval {
        Some(interval) => {
            eprintln!("   Cron: every {}s", interval.as_secs());
            Some(spawn_cron_ticker(Arc::clone(&orchestrator), interval))
        }
        None => {
            eprintln!("   Cron: disabled");
            None
        }
    };

    // ── HTTP / WebSocket server ─────────────────────────────────────────
    let app = api_routes(ApiState::new(orchestrator)).layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("binding port {}", config.http_port))?;
    eprintln!("   API: http://0.0.0.0:{}/api/jobs", config.http_port);
    eprintln!("   Streams: ws://0.0.0.0:{}/ws/streams/{{stream_id}}", config.http_port);
    tracing::info!(port = config.http_port, "Agent jobs server started");

    axum::serve(listener, app).await?;
    Ok(())
}
