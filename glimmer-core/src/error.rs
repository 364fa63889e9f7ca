use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the request-to-inference pipeline.
///
/// The server maps these onto HTTP statuses in exactly one place; nothing
/// below the API surface knows about status codes.
#[derive(Error, Debug)]
pub enum Error {
    /// The request is missing required input; the model was never called.
    #[error("{0}")]
    Validation(String),

    /// The model handle has not been installed yet.
    #[error("Model is not loaded yet. Please wait for the model to finish loading.")]
    ServiceUnavailable,

    /// The model call itself failed or panicked.
    #[error("Error generating image: {0}")]
    Generation(String),

    /// An uploaded reference file could not be decoded as an image.
    #[error("Failed to decode uploaded image `{name}`: {message}")]
    Decode { name: String, message: String },

    #[error("Failed to encode generated image: {0}")]
    Encode(String),
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}
