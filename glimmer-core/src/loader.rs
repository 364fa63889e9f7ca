use std::future::Future;

use anyhow::Result;
use candle_core::Device;
use hf_hub::api::tokio::Api;

use crate::ImageModel;

/// Knobs that apply at load time rather than per request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadOptions {
    /// Fraction of the noise schedule re-run on top of reference images.
    /// `1.0` ignores the references entirely, `0.0` returns them unchanged.
    pub img2img_strength: f64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            img2img_strength: 0.75,
        }
    }
}

pub trait Loader {
    type Model: ImageModel;
    type Variant;

    fn load(
        repo: &str,
        variant: Self::Variant,
        api: Api,
        device: Device,
        options: LoadOptions,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
