//! Frame decoding and face-region normalization.
//!
//! Everything between "opaque bytes from the caller" and "sample the
//! classifier can score": grayscale decode, histogram equalization, padded
//! square cropping and the whole-image fallback region.

use crate::types::{DetectedFace, FeatureSample, GRID_SIZE};
use image::imageops::{self, FilterType};
use image::GrayImage;
use thiserror::Error;

/// Fraction of the box width/height added on each side before cropping.
const REGION_PAD_FRACTION: f32 = 0.10;
/// Intensity bins for 8-bit equalization.
const HIST_BINS: usize = 256;

#[derive(Error, Debug)]
pub enum ImagingError {
    #[error("undecodable image: {0}")]
    Undecodable(#[from] image::ImageError),
    #[error("image has zero area")]
    EmptyImage,
}

/// Decode opaque image bytes (JPEG, PNG, ...) into an 8-bit grayscale frame.
pub fn decode_frame(bytes: &[u8]) -> Result<GrayImage, ImagingError> {
    let gray = image::load_from_memory(bytes)?.to_luma8();
    if gray.width() == 0 || gray.height() == 0 {
        return Err(ImagingError::EmptyImage);
    }
    Ok(gray)
}

/// Global histogram equalization over the full 0-255 range.
///
/// Flattens lighting differences between enrollment and capture so the
/// pixel-space distance compares structure, not exposure. A constant image is
/// left unchanged.
pub fn equalize(pixels: &mut [u8]) {
    let total = pixels.len() as u32;
    if total == 0 {
        return;
    }

    let mut hist = [0u32; HIST_BINS];
    for &p in pixels.iter() {
        hist[p as usize] += 1;
    }

    let mut cdf = [0u32; HIST_BINS];
    let mut running = 0u32;
    for (bin, &count) in hist.iter().enumerate() {
        running += count;
        cdf[bin] = running;
    }

    let cdf_min = match cdf.iter().copied().find(|&c| c > 0) {
        Some(c) if c < total => c,
        // Single occupied bin: nothing to spread.
        _ => return,
    };

    let denom = (total - cdf_min) as f32;
    let mut lut = [0u8; HIST_BINS];
    for bin in 0..HIST_BINS {
        let scaled = (cdf[bin].saturating_sub(cdf_min)) as f32 / denom * 255.0;
        lut[bin] = scaled.round().clamp(0.0, 255.0) as u8;
    }

    for p in pixels.iter_mut() {
        *p = lut[*p as usize];
    }
}

/// Crop the padded, centered square around a detected face.
///
/// The box grows by [`REGION_PAD_FRACTION`] on each side, is clamped to the
/// image, and the largest centered square of the result is taken. Returns
/// `None` for regions that degenerate to nothing after clamping.
pub fn crop_region(gray: &GrayImage, face: &DetectedFace) -> Option<GrayImage> {
    let img_w = gray.width() as f32;
    let img_h = gray.height() as f32;

    let pad_w = face.width * REGION_PAD_FRACTION;
    let pad_h = face.height * REGION_PAD_FRACTION;
    let x0 = (face.x - pad_w).max(0.0);
    let y0 = (face.y - pad_h).max(0.0);
    let x1 = (face.x + face.width + pad_w).min(img_w);
    let y1 = (face.y + face.height + pad_h).min(img_h);

    let w = x1 - x0;
    let h = y1 - y0;
    let side = w.min(h).floor();
    if side < 1.0 {
        return None;
    }

    let sx = x0 + (w - side) / 2.0;
    let sy = y0 + (h - side) / 2.0;
    let crop = imageops::crop_imm(gray, sx as u32, sy as u32, side as u32, side as u32).to_image();
    Some(crop)
}

/// Resize a face crop to the feature grid without equalization.
///
/// This is the stored-sample form: enrollment keeps raw grids and training
/// equalizes them, so stored and captured pixels go through one path.
pub fn raw_sample(crop: &GrayImage) -> Option<FeatureSample> {
    if crop.width() == 0 || crop.height() == 0 {
        return None;
    }
    let resized = imageops::resize(crop, GRID_SIZE as u32, GRID_SIZE as u32, FilterType::Triangle);
    FeatureSample::from_pixels(resized.into_raw())
}

/// Normalize a detected region into a classifier-ready query sample.
pub fn extract_features(gray: &GrayImage, face: &DetectedFace) -> Option<FeatureSample> {
    let crop = crop_region(gray, face)?;
    let sample = raw_sample(&crop)?;
    let mut pixels = sample.into_pixels();
    equalize(&mut pixels);
    FeatureSample::from_pixels(pixels)
}

/// Largest centered square of the frame.
///
/// Used when no detector is available or detection found nothing, keeping the
/// pipeline degraded-but-available instead of failing the frame.
pub fn fallback_region(gray: &GrayImage) -> DetectedFace {
    let w = gray.width() as f32;
    let h = gray.height() as f32;
    let side = w.min(h);
    DetectedFace {
        x: (w - side) / 2.0,
        y: (h - side) / 2.0,
        width: side,
        height: side,
        score: 0.0,
    }
}
