//! Duplex server entry point

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use duplex_config::{load_settings, Settings};
use duplex_pipeline::{
    EngineSet, HttpStreamingLlm, NeutralAnimation, ScriptedAsr, ScriptedLlm, SilenceTts,
};
use duplex_server::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Priority: env vars > config/{env}.toml > config/default.toml > defaults.
    let env = std::env::var("DUPLEX_ENV").ok();
    let config = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized; fail loudly for invalid config,
            // fall back to defaults only when no files were present.
            eprintln!("warning: failed to load config ({e}), using defaults");
            let settings = Settings::default();
            settings.validate()?;
            settings
        }
    };

    init_tracing(&config);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        env = env.as_deref().unwrap_or("default"),
        "starting duplex server"
    );

    let engines = build_engines(&config)?;
    let state = AppState::new(config.clone(), engines);
    state.spawn_background_tasks();
    tracing::info!(
        max_sessions = config.session.max_concurrent_sessions,
        animation = config.animation.animation_enabled,
        "application state initialized"
    );

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

/// Assemble the engine adapter set. The LLM talks to the configured HTTP
/// backend; ASR/TTS/animation default to the built-in adapters until a
/// production engine is wired in via `DUPLEX_LLM__ENDPOINT` and friends.
fn build_engines(config: &Settings) -> Result<EngineSet, Box<dyn std::error::Error>> {
    let llm: Arc<dyn duplex_core::LanguageModel> =
        match HttpStreamingLlm::new(&config.llm.endpoint, "duplex-chat") {
            Ok(llm) => Arc::new(llm),
            Err(e) => {
                tracing::warn!(error = %e, "http llm unavailable, using scripted fallback");
                Arc::new(ScriptedLlm::new(
                    "I am a placeholder response from the scripted language model.",
                ))
            }
        };
    Ok(EngineSet {
        asr: Arc::new(ScriptedAsr::new("placeholder transcript")),
        llm,
        tts: Arc::new(SilenceTts::default()),
        animation: if config.animation.animation_enabled {
            Some(Arc::new(NeutralAnimation))
        } else {
            None
        },
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("duplex={},tower_http=info", config.observability.log_level).into()
    });

    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
