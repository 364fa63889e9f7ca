use candle_core::Device;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::{Error, Generator, Result};

/// Which capability a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    TextToImage,
    ImageToImage,
}

serde_plain::derive_display_from_serialize!(Mode);

/// Values used for any field a request leaves out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Defaults {
    pub height: usize,
    pub width: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub seed: i64,
}

impl Mode {
    /// Geometry defaults differ per mode to match each mode's usual aspect
    /// ratio; everything else is shared.
    pub const fn defaults(self) -> Defaults {
        let (height, width) = match self {
            Mode::TextToImage => (32 * 32, 36 * 32),
            Mode::ImageToImage => (33 * 32, 32 * 32),
        };
        Defaults {
            height,
            width,
            num_inference_steps: 50,
            guidance_scale: 1.5,
            seed: 42,
        }
    }
}

/// Scalar fields as they arrive on the wire. Signed so that non-positive
/// values reach validation instead of failing deserialization.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub num_inference_steps: Option<i64>,
    #[serde(default)]
    pub guidance_scale: Option<f64>,
    #[serde(default)]
    pub seed: Option<i64>,
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub enum GenerationRequest {
    TextToImage(GenerationParams),
    ImageToImage {
        params: GenerationParams,
        reference_images: Vec<DynamicImage>,
    },
}

/// Fully resolved, model-ready call description.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub prompt: String,
    /// Empty for text-to-image.
    pub reference_images: Vec<DynamicImage>,
    pub height: usize,
    pub width: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    /// `None` means the model's own randomness is used.
    pub generator: Option<Generator>,
}

impl Invocation {
    pub fn mode(&self) -> Mode {
        if self.reference_images.is_empty() {
            Mode::TextToImage
        } else {
            Mode::ImageToImage
        }
    }

    pub fn seed(&self) -> Option<u64> {
        self.generator.as_ref().map(Generator::seed)
    }
}

impl GenerationRequest {
    pub fn mode(&self) -> Mode {
        match self {
            GenerationRequest::TextToImage(_) => Mode::TextToImage,
            GenerationRequest::ImageToImage { .. } => Mode::ImageToImage,
        }
    }

    pub fn params(&self) -> &GenerationParams {
        match self {
            GenerationRequest::TextToImage(params) => params,
            GenerationRequest::ImageToImage { params, .. } => params,
        }
    }

    /// Validate the request, fill in defaults and derive the generator.
    ///
    /// Numeric fields are only required to be positive. Anything the model
    /// cannot handle is left for the model to reject.
    pub fn resolve(self, device: &Device) -> Result<Invocation> {
        let defaults = self.mode().defaults();
        let (params, reference_images) = match self {
            GenerationRequest::TextToImage(params) => (params, Vec::new()),
            GenerationRequest::ImageToImage {
                params,
                reference_images,
            } => {
                if reference_images.is_empty() {
                    return Err(Error::validation("Please upload at least one image"));
                }
                (params, reference_images)
            }
        };

        if params.prompt.trim().is_empty() {
            return Err(Error::validation("Please enter a prompt"));
        }

        let height = positive("height", params.height, defaults.height)?;
        let width = positive("width", params.width, defaults.width)?;
        let num_inference_steps = positive(
            "num_inference_steps",
            params.num_inference_steps,
            defaults.num_inference_steps,
        )?;

        let guidance_scale = params.guidance_scale.unwrap_or(defaults.guidance_scale);
        if !(guidance_scale > 0.0 && guidance_scale.is_finite()) {
            return Err(Error::validation(format!(
                "guidance_scale must be a positive number, got {guidance_scale}"
            )));
        }

        let seed = params.seed.unwrap_or(defaults.seed);
        let generator = u64::try_from(seed)
            .ok()
            .map(|seed| Generator::new(seed, device));

        Ok(Invocation {
            prompt: params.prompt,
            reference_images,
            height,
            width,
            num_inference_steps,
            guidance_scale,
            generator,
        })
    }
}

fn positive(field: &str, value: Option<i64>, default: usize) -> Result<usize> {
    match value {
        None => Ok(default),
        Some(v) => usize::try_from(v)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| Error::validation(format!("{field} must be a positive integer, got {v}"))),
    }
}
