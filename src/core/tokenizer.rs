//! Local token estimation for prompts, images and relayed content.
//!
//! Used when an upstream reports no usage. Text is counted with the
//! `cl100k_base` BPE. Images are sized from their header and priced with the
//! tile formula (85 base tokens plus 170 per 512px tile after scaling).

use crate::api::models::ChatStreamRequest;
use base64::{engine::general_purpose, Engine as _};
use image::ImageReader;
use once_cell::sync::Lazy;
use std::io::Cursor;
use thiserror::Error;
use tiktoken_rs::CoreBPE;

const IMAGE_BASE_TOKENS: i64 = 85;
const IMAGE_TILE_TOKENS: i64 = 170;
const IMAGE_TILE_SIZE: f64 = 512.0;
const IMAGE_MAX_SIDE: f64 = 2048.0;
const IMAGE_SHORT_SIDE: f64 = 768.0;

static CL100K: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!("Failed to load cl100k_base tokenizer: {}. Falling back to length estimate.", e);
        None
    }
});

/// Why an image could not be sized.
#[derive(Debug, Error)]
pub enum ImageTokenError {
    #[error("invalid base64 image payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("unrecognized image format")]
    UnknownFormat,

    #[error("unreadable image header: {0}")]
    Header(#[from] image::ImageError),

    #[error("image read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Token counting collaborator.
pub trait TokenEstimator: Send + Sync {
    fn count_text(&self, text: &str, model: &str) -> i64;

    fn count_image(&self, image: &str, model: &str) -> Result<i64, ImageTokenError>;
}

/// Default estimator backed by `tiktoken-rs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TiktokenEstimator;

impl TokenEstimator for TiktokenEstimator {
    fn count_text(&self, text: &str, _model: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        match CL100K.as_ref() {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as i64,
            None => (text.chars().count() as i64 + 3) / 4,
        }
    }

    fn count_image(&self, image: &str, _model: &str) -> Result<i64, ImageTokenError> {
        let bytes = decode_image_payload(image)?;
        let (width, height) = image_dimensions(&bytes)?;
        Ok(tile_tokens(width, height))
    }
}

/// Decode a bare base64 payload or a `data:` URL.
pub fn decode_image_payload(image: &str) -> Result<Vec<u8>, ImageTokenError> {
    let payload = match image.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => image,
    };
    let payload = payload.trim();
    match general_purpose::STANDARD.decode(payload) {
        Ok(bytes) => Ok(bytes),
        Err(_) => Ok(general_purpose::STANDARD_NO_PAD.decode(payload.trim_end_matches('='))?),
    }
}

/// Read pixel dimensions from the image header.
pub fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32), ImageTokenError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    if reader.format().is_none() {
        return Err(ImageTokenError::UnknownFormat);
    }
    Ok(reader.into_dimensions()?)
}

/// Tile-based token cost of a `width` x `height` image.
pub fn tile_tokens(width: u32, height: u32) -> i64 {
    if width == 0 || height == 0 {
        return IMAGE_BASE_TOKENS;
    }
    let (mut w, mut h) = (f64::from(width), f64::from(height));

    let longest = w.max(h);
    if longest > IMAGE_MAX_SIDE {
        let scale = IMAGE_MAX_SIDE / longest;
        w *= scale;
        h *= scale;
    }
    let shortest = w.min(h);
    if shortest > IMAGE_SHORT_SIDE {
        let scale = IMAGE_SHORT_SIDE / shortest;
        w *= scale;
        h *= scale;
    }

    let tiles = (w / IMAGE_TILE_SIZE).ceil() as i64 * (h / IMAGE_TILE_SIZE).ceil() as i64;
    IMAGE_BASE_TOKENS + IMAGE_TILE_TOKENS * tiles
}

/// Estimate prompt tokens for an inbound envelope.
///
/// Text, each image (or `default_image_tokens` when it cannot be sized) and
/// the model name itself are counted. The total is floored at 1.
pub fn estimate_prompt_tokens(
    estimator: &dyn TokenEstimator,
    request: &ChatStreamRequest,
    default_image_tokens: i64,
) -> i64 {
    let model = request.model.as_str();
    let mut total = 0;

    if !request.data.is_empty() {
        total += estimator.count_text(&request.data, model);
    }

    for image in request.images.iter().filter(|i| !i.is_empty()) {
        total += match estimator.count_image(image, model) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(
                    "Failed to size image: {}, using default {}",
                    e,
                    default_image_tokens
                );
                default_image_tokens
            }
        };
    }

    if !model.is_empty() {
        total += estimator.count_text(model, model);
    }

    total.max(1)
}
