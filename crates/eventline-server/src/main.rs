use anyhow::Context;
use tracing::info;

use eventline_server::config::Settings;
use eventline_server::{app, build_state, spawn_background_tasks};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,eventline_server=debug".into()),
        )
        .init();

    let settings = Settings::new().context("failed to load configuration")?;
    let bind_addr = settings.bind_addr.clone();

    let state = build_state(settings).await;
    spawn_background_tasks(&state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "eventline server listening");

    axum::serve(listener, app(state))
        .await
        .context("server error")?;

    Ok(())
}
