// =============================================================================
// fxdash-sync — Main Entry Point
// =============================================================================
//
// Loads configuration, seeds credentials, optionally logs in, starts one
// market sync per configured pair and serves the dashboard feed until Ctrl+C.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fxdash_sync::api;
use fxdash_sync::api::auth::ENV_DASHBOARD_TOKEN;
use fxdash_sync::app_state::AppState;
use fxdash_sync::backend::{ApiClient, AuthClient, CredentialProvider, LocalStore, LoginOutcome, StoredCredentials};
use fxdash_sync::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "fxdash_config.json";
const STATUS_LOG_INTERVAL_SECS: u64 = 30;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("fxdash-sync starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        api_url = %config.api_url,
        stream_base = %config.stream_base(),
        streams = ?config.streams,
        "Configured market data sync"
    );

    // ── 2. Credentials & backend client ──────────────────────────────────
    let store = Arc::new(LocalStore::new());
    let credentials = Arc::new(StoredCredentials::new(store));
    if let Some(token) = env_var("FXDASH_API_TOKEN") {
        credentials.set_token(token);
        info!("API token seeded from environment");
    }
    credentials.on_invalidate(|| {
        error!("Backend rejected the API token; refresh FXDASH_API_TOKEN or the login credentials");
    });

    let api_client = ApiClient::new(config.api_url.clone(), credentials.clone(), config.fetch_timeout())
        .context("failed to build backend client")?;

    // ── 3. Optional startup login ────────────────────────────────────────
    if let (Some(email), Some(password)) = (env_var("FXDASH_EMAIL"), env_var("FXDASH_PASSWORD")) {
        let auth = AuthClient::new(api_client.clone());
        match auth.login(&email, &password).await {
            Ok(LoginOutcome::Authenticated(_)) => info!(email = %email, "Logged in"),
            Ok(LoginOutcome::OtpRequired { message }) => match env_var("FXDASH_OTP") {
                Some(otp) => match auth.verify_otp(&email, &otp).await {
                    Ok(_) => info!(email = %email, "Logged in with OTP"),
                    Err(e) => warn!(error = %e, "OTP verification failed, continuing unauthenticated"),
                },
                None => warn!(
                    message = message.as_deref().unwrap_or(""),
                    "Login requires an OTP; set FXDASH_OTP and restart"
                ),
            },
            Err(e) => warn!(error = %e, "Login failed, continuing unauthenticated"),
        }
    }

    // ── 4. Shared state & syncs ──────────────────────────────────────────
    let stream_keys = config.stream_keys();
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, api_client).with_dashboard_token(env_var(ENV_DASHBOARD_TOKEN)));
    if state.dashboard_token().is_none() {
        warn!("{ENV_DASHBOARD_TOKEN} is not set; control routes are disabled");
    }

    for key in stream_keys {
        state.watch(key);
    }

    // ── 5. Dashboard feed ────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind dashboard server on {bind_addr}"))?;
    info!(addr = %bind_addr, "Dashboard server listening");

    let app = api::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Dashboard server failed");
        }
    });

    // ── 6. Status log loop ───────────────────────────────────────────────
    let status_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(STATUS_LOG_INTERVAL_SECS));
        interval.tick().await;
        loop {
            interval.tick().await;
            for s in status_state.summaries() {
                info!(
                    key = %s.key,
                    connection = %s.connection,
                    candles = s.candle_count,
                    last_close = ?s.last_close,
                    reconnect_attempts = s.reconnect_attempts,
                    error = ?s.error,
                    "sync status"
                );
            }
        }
    });

    info!("All syncs running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    state.shutdown().await;

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("fxdash-sync shut down complete.");
    Ok(())
}
