//! Ingest Daemon
//!
//! Token resolution and server lifecycle for the loopback HTTP surface.

mod importance;
mod server;

pub use importance::ImportanceScorer;
pub use server::{router, AppState};

use crate::config::{DataPaths, KaitConfig};
use crate::errors::{IngestError, KaitError, Result};
use crate::queue::EventQueue;
use std::fs;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::watch;

/// Resolve the bearer token: environment first, then the token file. A
/// missing file is created with a fresh token and 0600 permissions.
pub fn resolve_token(config: &KaitConfig, paths: &DataPaths) -> Result<String> {
    if let Some(token) = &config.daemon.token {
        return Ok(token.clone());
    }

    let path = paths.token_file();
    if path.exists() {
        let token = fs::read_to_string(&path).map_err(|e| {
            KaitError::Ingest(IngestError::TokenUnreadable {
                path: path.clone(),
                message: e.to_string(),
            })
        })?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(KaitError::Ingest(IngestError::TokenUnreadable {
                path,
                message: "token file is empty".to_string(),
            }));
        }
        return Ok(token);
    }

    let token = uuid::Uuid::new_v4().simple().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            KaitError::Ingest(IngestError::TokenUnreadable {
                path: path.clone(),
                message: e.to_string(),
            })
        })?;
    }
    fs::write(&path, format!("{}\n", token)).map_err(|e| {
        KaitError::Ingest(IngestError::TokenUnreadable {
            path: path.clone(),
            message: e.to_string(),
        })
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
    }
    Ok(token)
}

/// Bind and serve the ingest surface until shutdown flips. A bind conflict
/// maps to the dedicated exit code.
pub async fn serve(
    config: KaitConfig,
    paths: DataPaths,
    queue: Arc<EventQueue>,
    depth_gauge: Arc<AtomicU64>,
    token: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let state = AppState {
        queue,
        paths,
        token,
        depth_gauge,
        hard_pressure: config.pipeline.hard_pressure,
        workers: Arc::new(tokio::sync::Semaphore::new(config.daemon.worker_pool)),
    };
    let app = router(state, config.daemon.max_body_bytes);

    let addr = format!("{}:{}", config.daemon.bind, config.daemon.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            KaitError::PortBind(config.daemon.port)
        } else {
            KaitError::Config(format!("failed to bind {}: {}", addr, e))
        }
    })?;
    tracing::info!(addr = %addr, "Ingest daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| KaitError::Internal(format!("server error: {}", e)))?;
    Ok(())
}
