use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::flux::autoencoder::{Config, Decoder, Encoder};
use image::DynamicImage;

use crate::image_to_tensor;

/// Flux autoencoder. Encoding yields the posterior mean, never a sample,
/// so the same pixels always give the same latents.
pub(crate) struct Vae {
    encoder: Encoder,
    decoder: Decoder,
    z_channels: usize,
    scale_factor: f64,
    shift_factor: f64,
}

impl Vae {
    pub(crate) fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: Encoder::new(cfg, vb.pp("encoder"))?,
            decoder: Decoder::new(cfg, vb.pp("decoder"))?,
            z_channels: cfg.z_channels,
            scale_factor: cfg.scale_factor,
            shift_factor: cfg.shift_factor,
        })
    }

    /// Pixels in `[-1, 1]` to scaled latents.
    pub(crate) fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        // Encoder output stacks mean and log-variance along channels.
        let moments = self.encoder.forward(pixels)?;
        let mean = moments.narrow(1, 0, self.z_channels)?;
        (mean - self.shift_factor)? * self.scale_factor
    }

    pub(crate) fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = ((latents / self.scale_factor)? + self.shift_factor)?;
        self.decoder.forward(&latents)
    }

    /// Encodes every reference at the given pixel size and averages the
    /// latents.
    pub(crate) fn reference_latents(
        &self,
        images: &[DynamicImage],
        height: usize,
        width: usize,
        device: &Device,
        dtype: DType,
    ) -> anyhow::Result<Tensor> {
        let latents = images
            .iter()
            .map(|img| {
                let pixels = image_to_tensor(img, height, width, device, dtype)?;
                Ok(self.encode(&pixels)?)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&latents, 0)?.mean_keepdim(0)?)
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn zero_vae() -> Vae {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        Vae::new(&Config::schnell(), vb).unwrap()
    }

    fn checker(size: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        }))
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn encoding_the_same_reference_is_repeatable() {
        let vae = zero_vae();
        let refs = [checker(16)];
        let first = vae
            .reference_latents(&refs, 16, 16, &Device::Cpu, DType::F32)
            .unwrap();
        let second = vae
            .reference_latents(&refs, 16, 16, &Device::Cpu, DType::F32)
            .unwrap();
        assert_eq!(first.dims(), &[1, 16, 2, 2]);
        assert_eq!(values(&first), values(&second));
    }

    #[test]
    fn several_references_average_into_one_latent() {
        let vae = zero_vae();
        let refs = [checker(16), checker(8), checker(24)];
        let latents = vae
            .reference_latents(&refs, 16, 16, &Device::Cpu, DType::F32)
            .unwrap();
        assert_eq!(latents.dims(), &[1, 16, 2, 2]);

        let single = vae
            .reference_latents(&refs[..1], 16, 16, &Device::Cpu, DType::F32)
            .unwrap();
        // Zero weights map every image to the same latent, so the mean
        // equals any one of them.
        let (a, b) = (values(&latents), values(&single));
        assert!(a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1e-6));
    }

    #[test]
    fn decode_restores_pixel_resolution() {
        let vae = zero_vae();
        let latents = Tensor::zeros((1, 16, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let pixels = vae.decode(&latents).unwrap();
        assert_eq!(pixels.dims(), &[1, 3, 16, 16]);
    }
}
