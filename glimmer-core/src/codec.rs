use std::io::Cursor;

use base64::prelude::*;
use image::{DynamicImage, ImageFormat};

use crate::{Error, Result};

/// Prefix of every encoded result; clients use the string directly as an
/// image source.
pub const DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// Encodes an image as a PNG data URI.
pub fn image_to_data_uri(image: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| Error::Encode(e.to_string()))?;
    let mut uri = String::with_capacity(DATA_URI_PREFIX.len() + bytes.len() * 4 / 3 + 4);
    uri.push_str(DATA_URI_PREFIX);
    BASE64_STANDARD.encode_string(&bytes, &mut uri);
    Ok(uri)
}

/// Decodes an uploaded file and normalizes it to 8-bit RGB.
pub fn decode_reference(name: &str, bytes: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(bytes).map_err(|e| Error::Decode {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}
