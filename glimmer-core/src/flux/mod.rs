use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{
        autoencoder,
        model::{self, Flux},
        sampling,
    },
    t5::{self, T5EncoderModel},
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::{tensor_to_image, ImageModel, Invocation, LoadOptions, Loader};

mod vae;

use vae::Vae;

const T5_MAX_TOKENS: usize = 256;
const CLIP_MAX_TOKENS: usize = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FluxVariant {
    Schnell,
    Dev,
}

serde_plain::derive_display_from_serialize!(FluxVariant);
serde_plain::derive_fromstr_from_deserialize!(FluxVariant);

impl FluxVariant {
    fn weights_file(&self) -> String {
        format!("flux1-{self}.safetensors")
    }

    /// Sampling schedule; `dev` shifts it by the latent sequence length.
    fn schedule(&self, steps: usize, image_seq_len: usize) -> Vec<f64> {
        match self {
            FluxVariant::Schnell => sampling::get_schedule(steps, None),
            FluxVariant::Dev => sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15))),
        }
    }
}

/// Cuts a token sequence to `max_len`, keeping its final (end) token.
fn truncate_tokens(mut tokens: Vec<u32>, max_len: usize) -> Vec<u32> {
    if tokens.len() > max_len {
        let end = tokens[tokens.len() - 1];
        tokens.truncate(max_len);
        if let Some(last) = tokens.last_mut() {
            *last = end;
        }
    }
    tokens
}

/// Packed latent grid for an output of the given pixel size: 16 channels at
/// 1/8 resolution, rounded up to an even number of cells.
fn latent_shape(height: usize, width: usize) -> (usize, usize, usize, usize) {
    (1, 16, height.div_ceil(16) * 2, width.div_ceil(16) * 2)
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    img2img_strength: f64,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: Vae,
    flux_model: Flux,
}

impl FluxModel {
    fn text_embeddings(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_MAX_TOKENS, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&input_token_ids)?;

        let clip_tokens = truncate_tokens(
            self.clip_tokenizer
                .encode(prompt, true)
                .map_err(Error::msg)?
                .get_ids()
                .to_vec(),
            CLIP_MAX_TOKENS,
        );
        let input_token_ids = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids)?;

        Ok((t5_emb, clip_emb))
    }
}

impl ImageModel for FluxModel {
    fn generate(&mut self, invocation: Invocation) -> Result<DynamicImage> {
        let Invocation {
            prompt,
            reference_images,
            height,
            width,
            num_inference_steps,
            guidance_scale,
            mut generator,
        } = invocation;

        let shape = latent_shape(height, width);
        let (_, _, latent_h, latent_w) = shape;
        let noise = match generator.as_mut() {
            Some(generator) => generator.randn(shape)?,
            None => sampling::get_noise(1, height, width, &self.device)?,
        }
        .to_dtype(self.dtype)?;

        let (t5_emb, clip_emb) = self.text_embeddings(&prompt)?;
        tracing::debug!("computed prompt embeddings");

        let timesteps = self
            .variant
            .schedule(num_inference_steps, (latent_h / 2) * (latent_w / 2));

        let (init, timesteps) = if reference_images.is_empty() {
            (noise, &timesteps[..])
        } else {
            let references = self.autoencoder.reference_latents(
                &reference_images,
                latent_h * 8,
                latent_w * 8,
                &self.device,
                self.dtype,
            )?;
            let start = timesteps
                .iter()
                .position(|t| *t <= self.img2img_strength)
                .unwrap_or(timesteps.len() - 1);
            let t = timesteps[start];
            tracing::debug!(
                references = reference_images.len(),
                start_step = start,
                t,
                "blending reference latents"
            );
            let init = ((&noise * t)? + (references * (1.0 - t))?)?;
            (init, &timesteps[start..])
        };

        let state = sampling::State::new(&t5_emb, &clip_emb, &init)?;
        let latent_img = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            timesteps,
            guidance_scale,
        )?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        tracing::debug!("denoised latents");

        let decoded = self.autoencoder.decode(&unpacked)?;
        let decoded = decoded.narrow(2, 0, height)?.narrow(3, 0, width)?;

        // [-1, 1] -> [0, 255]
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

struct FluxFiles {
    t5_weights: PathBuf,
    t5_config: PathBuf,
    t5_tokenizer: PathBuf,
    clip_weights: PathBuf,
    clip_tokenizer: PathBuf,
    autoencoder: PathBuf,
    transformer: PathBuf,
}

impl FluxFiles {
    async fn fetch(api: &Api, repo: &str, variant: FluxVariant) -> Result<Self> {
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let flux_repo = api.repo(hf_hub::Repo::model(repo.to_string()));

        Ok(Self {
            t5_weights: t5_repo
                .get("model.safetensors")
                .await
                .context("failed to get T5 model file")?,
            t5_config: t5_repo
                .get("config.json")
                .await
                .context("failed to get T5 config")?,
            t5_tokenizer: api
                .model("lmz/mt5-tokenizers".to_string())
                .get("t5-v1_1-xxl.tokenizer.json")
                .await
                .context("failed to get T5 tokenizer")?,
            clip_weights: clip_repo
                .get("model.safetensors")
                .await
                .context("failed to get CLIP model file")?,
            clip_tokenizer: clip_repo
                .get("tokenizer.json")
                .await
                .context("failed to get CLIP tokenizer")?,
            autoencoder: flux_repo
                .get("ae.safetensors")
                .await
                .context("failed to get autoencoder model file")?,
            transformer: flux_repo
                .get(&variant.weights_file())
                .await
                .context("failed to get flux model file")?,
        })
    }
}

fn build_model(
    files: FluxFiles,
    variant: FluxVariant,
    device: Device,
    options: LoadOptions,
) -> Result<FluxModel> {
    let dtype = device.bf16_default_to_f32();

    let t5_vb = unsafe {
        candle_nn::VarBuilder::from_mmaped_safetensors(&[files.t5_weights], dtype, &device)
            .context("failed to build T5 var builder")?
    };
    let config_str =
        std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
    let t5_config: t5::Config =
        serde_json::from_str(&config_str).context("failed to parse T5 config")?;
    let t5_model = T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
    let t5_tokenizer = Tokenizer::from_file(files.t5_tokenizer)
        .map_err(Error::msg)
        .context("failed to load T5 tokenizer")?;
    tracing::info!("loaded T5 encoder");

    let clip_vb = unsafe {
        candle_nn::VarBuilder::from_mmaped_safetensors(&[files.clip_weights], dtype, &device)
            .context("failed to build CLIP var builder")?
    };
    let clip_config = ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    };
    let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
        .context("failed to load CLIP model")?;
    let clip_tokenizer = Tokenizer::from_file(files.clip_tokenizer)
        .map_err(Error::msg)
        .context("failed to load CLIP tokenizer")?;
    tracing::info!("loaded CLIP encoder");

    let autoencoder_vb = unsafe {
        candle_nn::VarBuilder::from_mmaped_safetensors(&[files.autoencoder], dtype, &device)
            .context("failed to build autoencoder var builder")?
    };
    let autoencoder_config = match variant {
        FluxVariant::Schnell => autoencoder::Config::schnell(),
        FluxVariant::Dev => autoencoder::Config::dev(),
    };
    let autoencoder = Vae::new(&autoencoder_config, autoencoder_vb)
        .context("failed to load autoencoder")?;
    tracing::info!("loaded autoencoder");

    let flux_vb = unsafe {
        candle_nn::VarBuilder::from_mmaped_safetensors(&[files.transformer], dtype, &device)
            .context("failed to build flux var builder")?
    };
    let flux_config = match variant {
        FluxVariant::Schnell => model::Config::schnell(),
        FluxVariant::Dev => model::Config::dev(),
    };
    let flux_model = Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;
    tracing::info!(%variant, ?dtype, "loaded flux transformer");

    Ok(FluxModel {
        variant,
        device,
        dtype,
        img2img_strength: options.img2img_strength,
        t5_model,
        t5_tokenizer,
        clip_model,
        clip_tokenizer,
        autoencoder,
        flux_model,
    })
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Model = FluxModel;
    type Variant = FluxVariant;

    async fn load(
        repo: &str,
        variant: FluxVariant,
        api: Api,
        device: Device,
        options: LoadOptions,
    ) -> Result<Self::Model> {
        if !(0.0..=1.0).contains(&options.img2img_strength) {
            anyhow::bail!(
                "img2img strength must be within [0, 1], got {}",
                options.img2img_strength
            );
        }

        let files = FluxFiles::fetch(&api, repo, variant).await?;
        tracing::info!(repo, %variant, "model files available, building");

        // Weight mapping and model construction are blocking.
        tokio::task::spawn_blocking(move || build_model(files, variant, device, options))
            .await
            .context("model construction task failed")?
    }
}
