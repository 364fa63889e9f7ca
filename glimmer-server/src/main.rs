use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use glimmer_core::{load_model, select_best_device, DeviceMap, LoadOptions, ModelHandle};
use hf_hub::api::tokio::Api;
use tokio::net::TcpListener;

mod error;
mod routes;

use routes::AppState;

const DEFAULT_LOG_FILTER: &str = "glimmer_server=info,glimmer_core=info,tower_http=info";

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Glimmer image generation server")]
struct Args {
    /// Host address to bind the server to
    #[arg(long, env = "GLIMMER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "GLIMMER_PORT", default_value_t = 7860)]
    port: u16,

    /// Model repository to load
    #[arg(long, env = "GLIMMER_MODEL", default_value = "black-forest-labs/FLUX.1-schnell")]
    model: String,

    /// Use CPU instead of GPU
    #[arg(long, env = "GLIMMER_CPU")]
    cpu: bool,

    /// Accelerator to run on: `cpu` or a device ordinal
    #[arg(long, env = "GLIMMER_DEVICE", default_value_t = DeviceMap::default())]
    device: DeviceMap,

    /// Share of the sampling schedule re-run over reference images
    #[arg(long, env = "GLIMMER_IMG2IMG_STRENGTH", default_value_t = 0.75)]
    img2img_strength: f64,

    /// Maximum request body size in MiB
    #[arg(long, env = "GLIMMER_MAX_UPLOAD_MB", default_value_t = 64)]
    max_upload_mb: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "GLIMMER_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn device_map(&self) -> DeviceMap {
        if self.cpu {
            DeviceMap::ForceCpu
        } else {
            self.device
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "glimmer-server starting");

    let device = select_best_device(args.device_map()).context("failed to set up device")?;
    tracing::info!(?device, "selected compute device");

    // The server accepts traffic while the model loads; generation requests
    // get 503 until the handle is filled.
    let handle = Arc::new(ModelHandle::new(device.clone()));
    let app = routes::router(
        AppState {
            model: handle.clone(),
        },
        args.max_upload_mb * 1024 * 1024,
    );

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(address = %listener.local_addr()?, "HTTP server listening");

    let load = async {
        let options = LoadOptions {
            img2img_strength: args.img2img_strength,
        };
        let model = load_model(&args.model, Api::new()?, device, options)
            .await
            .with_context(|| format!("failed to load model {}", args.model))?;
        handle.install(model)?;
        tracing::info!(model = %args.model, "model ready");
        std::future::pending::<Result<()>>().await
    };
    let server = async {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };

    tokio::select! {
        result = server => result.context("server error")?,
        result = load => {
            if let Err(e) = &result {
                tracing::error!(error = ?e, "model loading failed");
            }
            result?;
        }
    }

    tracing::info!("glimmer-server stopped");
    Ok(())
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => tracing::warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
