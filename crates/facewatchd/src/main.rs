use anyhow::{Context, Result};
use facewatch_core::{CooldownGate, DetectorSettings};
use facewatch_store::SqliteStore;
use facewatch_video::{Annotator, DeviceLeases};
use facewatchd::{router, AppState, Config, OnnxModels, Pipeline, SystemSources};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let config = Config::from_env()?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        cooldown_secs = config.cooldown_secs,
        match_tolerance = config.match_tolerance,
        "configuration loaded"
    );

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
    );
    std::fs::create_dir_all(&config.upload_dir)
        .with_context(|| format!("failed to create upload dir {}", config.upload_dir.display()))?;

    let leases = DeviceLeases::new();
    let annotator = Annotator::new(config.font_path.as_deref(), config.jpeg_quality);
    let mut pipeline = Pipeline::new(
        store.clone(),
        store.clone(),
        Arc::new(SystemSources::new(config.source_settings(), leases.clone())),
        Arc::new(OnnxModels {
            detector_path: config.detector_model_path(),
            recognizer_path: config.recognizer_model_path(),
            settings: DetectorSettings::default(),
        }),
        Arc::new(annotator),
    );
    if config.shared_cooldown {
        tracing::info!("cooldown gate shared across streams");
        pipeline = pipeline.with_shared_gate(Arc::new(CooldownGate::default()));
    }

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(addr = %config.listen, "facewatchd ready");

    let state = Arc::new(AppState {
        config,
        store,
        pipeline,
        leases,
    });
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            // Keep running until signaled
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("facewatchd shutting down");
        })
        .await?;

    Ok(())
}
