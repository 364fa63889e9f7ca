#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod codec;
pub mod device_map;
pub mod error;
pub mod generator;
pub mod handle;
pub mod loader;
mod loader_factory;
pub mod request;
mod util;

mod flux;

pub use candle_core::Device;
pub use codec::*;
pub use device_map::*;
pub use error::{Error, Result};
pub use flux::{FluxLoader, FluxVariant};
pub use generator::Generator;
pub use handle::ModelHandle;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use request::*;
pub use util::select_best_device;
pub(crate) use util::*;

/// The generative capability behind the service.
///
/// Implementations produce exactly one image per call. They only need to be
/// `Send`; [`ModelHandle`] guarantees exclusive access.
pub trait ImageModel: Send {
    fn generate(&mut self, invocation: Invocation) -> anyhow::Result<DynamicImage>;
}
