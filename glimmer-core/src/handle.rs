use std::sync::{Arc, OnceLock};
use std::time::Instant;

use candle_core::Device;
use image::DynamicImage;
use tokio::sync::Mutex;

use crate::{Error, ImageModel, Invocation, Result};

type SharedModel = Arc<Mutex<Box<dyn ImageModel>>>;

/// Process-wide, load-once handle to the generative model.
///
/// The compute device is known from construction so requests can be
/// resolved while the weights are still loading; the model itself is
/// installed exactly once and every call into it is serialized.
pub struct ModelHandle {
    device: Device,
    model: OnceLock<SharedModel>,
}

impl ModelHandle {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            model: OnceLock::new(),
        }
    }

    /// Build a handle that is ready immediately.
    pub fn with_model(device: Device, model: Box<dyn ImageModel>) -> Self {
        let handle = Self::new(device);
        // A fresh handle has an empty slot.
        let _ = handle.model.set(Arc::new(Mutex::new(model)));
        handle
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_ready(&self) -> bool {
        self.model.get().is_some()
    }

    /// Installs the loaded model. Fails if one is already installed.
    pub fn install(&self, model: Box<dyn ImageModel>) -> anyhow::Result<()> {
        self.model
            .set(Arc::new(Mutex::new(model)))
            .map_err(|_| anyhow::anyhow!("a model is already installed"))
    }

    /// Runs one generation.
    ///
    /// Waits (without a timeout) until no other generation is in flight,
    /// then calls the model on the blocking pool. Once started the call
    /// runs to completion even if the caller stops waiting for it.
    pub async fn invoke(&self, invocation: Invocation) -> Result<DynamicImage> {
        let model = self.model.get().ok_or(Error::ServiceUnavailable)?.clone();

        let mut model = model.lock_owned().await;
        let mode = invocation.mode();
        let (height, width) = (invocation.height, invocation.width);
        let started = Instant::now();
        tracing::debug!(%mode, height, width, "model acquired");

        let image = tokio::task::spawn_blocking(move || model.generate(invocation))
            .await
            .map_err(|e| Error::Generation(format!("inference task failed: {e}")))?
            .map_err(|e| Error::Generation(format!("{e:#}")))?;

        tracing::info!(
            %mode,
            height,
            width,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );
        Ok(image)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("device", &self.device)
            .field("ready", &self.is_ready())
            .finish()
    }
}
