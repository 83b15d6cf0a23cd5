//! MCP server initialization for stdio and Streamable HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that build the
//! orchestrator from config, start background maintenance, and wire the MCP tool
//! handler into a running server.

use crate::config::QuireConfig;
use crate::orchestrator::{MaintenanceHandle, ServiceOrchestrator};
use crate::tools::QuireTools;
use anyhow::{Context, Result};
use rmcp::ServiceExt;
use std::net::SocketAddr;
use std::time::Duration;

/// Shared setup: register every configured service and start the maintenance ticker.
pub fn build_orchestrator(config: &QuireConfig) -> Result<(ServiceOrchestrator, MaintenanceHandle)> {
    let orchestrator = ServiceOrchestrator::new(config.orchestrator.clone());
    for service in &config.services {
        orchestrator
            .register_service(service.clone())
            .with_context(|| format!("failed to register service '{}'", service.name))?;
    }
    tracing::info!(services = ?orchestrator.services(), "orchestrator ready");

    let interval = Duration::from_millis(config.orchestrator.maintenance_interval_ms);
    let maintenance = orchestrator.spawn_maintenance(interval);

    Ok((orchestrator, maintenance))
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: QuireConfig) -> Result<()> {
    tracing::info!("starting Quire MCP server on stdio");

    let (orchestrator, maintenance) = build_orchestrator(&config)?;

    let tools = QuireTools::new(orchestrator);
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    maintenance.shutdown().await;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over Streamable HTTP transport.
pub async fn serve_http(config: QuireConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    tracing::info!(addr = %bind_addr, "starting Quire MCP server on HTTP");

    let (orchestrator, maintenance) = build_orchestrator(&config)?;

    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(QuireTools::new(orchestrator.clone())),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    // Connect info lets the tools key rate limits by peer address.
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    maintenance.shutdown().await;
    Ok(())
}
