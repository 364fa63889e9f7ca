use anyhow::{anyhow, Result};
use candle_core::Device;
use hf_hub::api::tokio::Api;

use crate::{flux::FluxVariant, FluxLoader, ImageModel, LoadOptions, Loader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Flux(FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("DEV") {
                FluxVariant::Dev
            } else {
                FluxVariant::Schnell
            }))
        } else {
            None
        }
    }
}

/// Load a model based on its repository name, picking the loader from the
/// detected variant.
pub async fn load_model(
    model_name: &str,
    api: Api,
    device: Device,
    options: LoadOptions,
) -> Result<Box<dyn ImageModel>> {
    let variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model: {}", model_name))?;

    tracing::info!(model = model_name, ?variant, ?options, "loading model");

    match variant {
        ModelVariant::Flux(variant) => {
            let model = FluxLoader::load(model_name, variant, api, device, options).await?;
            Ok(Box::new(model))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_flux_variants() {
        assert_eq!(
            ModelVariant::from_name("black-forest-labs/FLUX.1-schnell"),
            Some(ModelVariant::Flux(FluxVariant::Schnell))
        );
        assert_eq!(
            ModelVariant::from_name("black-forest-labs/FLUX.1-dev"),
            Some(ModelVariant::Flux(FluxVariant::Dev))
        );
        assert_eq!(
            ModelVariant::from_name("my-org/flux-finetune"),
            Some(ModelVariant::Flux(FluxVariant::Schnell))
        );
        assert_eq!(ModelVariant::from_name("zai-org/GLM-Image"), None);
    }
}
