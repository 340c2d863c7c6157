use anyhow::{Context, Result};
use axum::extract::{RawQuery, State};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::command::{self, CommandContext, FAILURE_UNKNOWN};

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(ctx: CommandContext) -> Router {
    Router::new()
        .route("/", get(remote_command))
        .route("/api/status", get(api_status))
        .with_state(ctx)
}

/// `GET /?CCC` or `GET /?CCC=PPP`: one remote command, plain-text reply.
async fn remote_command(
    State(ctx): State<CommandContext>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    match query {
        Some(q) if !q.is_empty() => command::handle(&ctx, &q).await,
        _ => FAILURE_UNKNOWN.to_string(),
    }
}

async fn api_status(State(ctx): State<CommandContext>) -> impl IntoResponse {
    let settings = ctx.settings.read().await.clone();
    let st = ctx.state.read().await;
    Json(st.to_status(settings))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(ctx: CommandContext, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "command and status server listening");

    axum::serve(listener, router(ctx))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
