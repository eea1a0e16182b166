use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use valet_agent::gemini::GeminiAdapter;
use valet_agent::{LlmAdapter, Orchestrator, ToolBroker};
use valet_core::config::ValetConfig;
use valet_tools::ToolCoordinator;

mod app;
mod auth;
mod http;
mod ws;

#[derive(Parser)]
#[command(name = "valet-gateway", about = "Conversational AI host")]
struct Args {
    /// Path to valet.toml (default: ./valet.toml)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "valet_gateway=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();

    // Startup configuration problems are fatal; everything later degrades.
    let config = ValetConfig::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("config load failed: {e}"))?;

    let raw_template =
        std::fs::read_to_string(&config.prompt.template_path).map_err(|e| {
            anyhow::anyhow!(
                "cannot read base prompt template '{}': {e}",
                config.prompt.template_path
            )
        })?;
    let fs_root = std::env::var("VALET_FS_ROOT").ok();
    let base_template =
        valet_agent::prompt::resolve_filesystem_info(&raw_template, fs_root.as_deref());
    info!(path = %config.prompt.template_path, "base prompt template loaded");

    let adapter: Arc<dyn LlmAdapter> = Arc::new(GeminiAdapter::new(
        config.llm.api_key.clone(),
        config.llm.base_url.clone(),
        config.llm.model.clone(),
    ));

    let coordinator = Arc::new(ToolCoordinator::new(&config.tools.config_path));
    coordinator.initialize().await.map_err(|e| {
        anyhow::anyhow!("tool coordinator initialization failed: {e}")
    })?;

    let broker: Arc<dyn ToolBroker> = coordinator.clone();
    let orchestrator = Arc::new(Orchestrator::new(adapter, broker));

    let state = Arc::new(app::AppState {
        config: config.clone(),
        orchestrator,
        coordinator: coordinator.clone(),
        base_template,
    });

    // Optional authenticating front tier on its own port.
    if let Some(auth_port) = config.gateway.auth_port {
        let addr: SocketAddr = format!("{}:{}", config.gateway.bind, auth_port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("valet auth gateway listening on {addr}");
        let router = auth::build_router(state.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "auth gateway server error");
            }
        });
    }

    let addr: SocketAddr =
        format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("valet gateway listening on {addr}");

    axum::serve(listener, app::build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await;
    info!("valet gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
