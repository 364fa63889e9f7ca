use std::f32::consts::TAU;

use candle_core::{Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeded randomness source bound to the model's compute device.
///
/// Noise is sampled on the host from a `StdRng` and then moved to the
/// device, so a given seed produces the same tensor on every backend.
#[derive(Debug, Clone)]
pub struct Generator {
    seed: u64,
    device: Device,
    rng: StdRng,
}

impl Generator {
    pub fn new(seed: u64, device: &Device) -> Self {
        Self {
            seed,
            device: device.clone(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Raw access to the underlying stream, for callers that need values
    /// other than normal noise.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Standard-normal f32 tensor of the given shape on the bound device.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S) -> candle_core::Result<Tensor> {
        let shape = shape.into();
        let len = shape.elem_count();
        let mut values = Vec::with_capacity(len + 1);
        // Box-Muller, two samples per pair of uniforms.
        while values.len() < len {
            let u1: f32 = 1.0 - self.rng.gen::<f32>();
            let u2: f32 = self.rng.gen::<f32>();
            let radius = (-2.0 * u1.ln()).sqrt();
            values.push(radius * (TAU * u2).cos());
            values.push(radius * (TAU * u2).sin());
        }
        values.truncate(len);
        Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(&self.device)
    }
}
