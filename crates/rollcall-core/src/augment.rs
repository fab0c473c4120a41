//! Enrollment-side sample augmentation.
//!
//! One face crop rarely covers the pose and lighting drift seen live, so
//! enrollment expands it into a jittered family: scale, brightness, small
//! rotations and mirror flips. All variants are produced at a working
//! resolution slightly above the feature grid, then downsampled.

use crate::imaging;
use crate::types::FeatureSample;
use image::imageops::{self, FilterType};
use image::GrayImage;
use rand::Rng;

/// Working edge length for jitter, above the final grid so rotation and
/// scaling do not chew into face pixels.
const WORK_SIZE: u32 = 60;
const SCALE_JITTER_MIN: f32 = 0.8;
const SCALE_JITTER_MAX: f32 = 1.2;
/// Max absolute brightness shift per sample, in intensity levels.
const BRIGHTNESS_JITTER: i32 = 30;
const ROTATION_MAX_DEGREES: f32 = 15.0;
/// Only every n-th sample gets a rotation on top of the other jitters.
const ROTATE_EVERY: usize = 3;
const FLIP_PROBABILITY: f64 = 0.5;

/// Default family size produced per enrollment photo.
pub const DEFAULT_SAMPLE_COUNT: usize = 100;

/// Expand one face crop into `count` feature samples.
///
/// The first sample is the unjittered crop itself; the rest are independent
/// random variants. Passing a seeded rng makes the family reproducible.
pub fn augment(crop: &GrayImage, count: usize, rng: &mut impl Rng) -> Vec<FeatureSample> {
    let mut samples = Vec::with_capacity(count);
    if count == 0 {
        return samples;
    }

    let base = imageops::resize(crop, WORK_SIZE, WORK_SIZE, FilterType::Triangle);
    if let Some(sample) = imaging::raw_sample(&base) {
        samples.push(sample);
    }

    for i in 1..count {
        let mut work = base.clone();

        let factor = rng.gen_range(SCALE_JITTER_MIN..=SCALE_JITTER_MAX);
        work = rescale(&work, factor);

        let delta = rng.gen_range(-BRIGHTNESS_JITTER..=BRIGHTNESS_JITTER);
        shift_brightness(&mut work, delta);

        if i % ROTATE_EVERY == 0 {
            let degrees = rng.gen_range(-ROTATION_MAX_DEGREES..=ROTATION_MAX_DEGREES);
            work = rotate_about_center(&work, degrees);
        }

        if rng.gen_bool(FLIP_PROBABILITY) {
            work = imageops::flip_horizontal(&work);
        }

        if let Some(sample) = imaging::raw_sample(&work) {
            samples.push(sample);
        }
    }

    samples
}

/// Resize by `factor`, then restore the working edge length: overshoot is
/// center-cropped, undershoot is edge-replicated back out.
fn rescale(img: &GrayImage, factor: f32) -> GrayImage {
    let scaled = ((WORK_SIZE as f32 * factor).round().max(1.0)) as u32;
    let resized = imageops::resize(img, scaled, scaled, FilterType::Triangle);
    if scaled >= WORK_SIZE {
        center_crop(&resized, WORK_SIZE)
    } else {
        pad_replicate(&resized, WORK_SIZE)
    }
}

fn shift_brightness(img: &mut GrayImage, delta: i32) {
    for pixel in img.pixels_mut() {
        pixel.0[0] = (pixel.0[0] as i32 + delta).clamp(0, 255) as u8;
    }
}

fn center_crop(img: &GrayImage, size: u32) -> GrayImage {
    let x = (img.width() - size) / 2;
    let y = (img.height() - size) / 2;
    imageops::crop_imm(img, x, y, size, size).to_image()
}

/// Grow to `size` by replicating edge pixels around a centered copy.
fn pad_replicate(img: &GrayImage, size: u32) -> GrayImage {
    let off_x = (size - img.width()) / 2;
    let off_y = (size - img.height()) / 2;
    GrayImage::from_fn(size, size, |x, y| {
        let sx = x.saturating_sub(off_x).min(img.width() - 1);
        let sy = y.saturating_sub(off_y).min(img.height() - 1);
        *img.get_pixel(sx, sy)
    })
}

/// Rotate around the image center, sampling the source bilinearly with edge
/// clamping so corners stay face-toned instead of black.
fn rotate_about_center(img: &GrayImage, degrees: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    let cx = (w.saturating_sub(1)) as f32 / 2.0;
    let cy = (h.saturating_sub(1)) as f32 / 2.0;
    // Inverse mapping: each output pixel pulls from the source rotated the
    // other way.
    let theta = -degrees.to_radians();
    let (sin, cos) = theta.sin_cos();
    GrayImage::from_fn(w, h, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = cx + dx * cos - dy * sin;
        let sy = cy + dx * sin + dy * cos;
        image::Luma([bilinear_clamped(img, sx, sy)])
    })
}

fn bilinear_clamped(img: &GrayImage, fx: f32, fy: f32) -> u8 {
    let max_x = (img.width() - 1) as f32;
    let max_y = (img.height() - 1) as f32;
    let fx = fx.clamp(0.0, max_x);
    let fy = fy.clamp(0.0, max_y);

    let x0 = fx.floor() as u32;
    let y0 = fy.floor() as u32;
    let x1 = (x0 + 1).min(img.width() - 1);
    let y1 = (y0 + 1).min(img.height() - 1);
    let tx = fx - x0 as f32;
    let ty = fy - y0 as f32;

    let p00 = img.get_pixel(x0, y0).0[0] as f32;
    let p10 = img.get_pixel(x1, y0).0[0] as f32;
    let p01 = img.get_pixel(x0, y1).0[0] as f32;
    let p11 = img.get_pixel(x1, y1).0[0] as f32;

    let top = p00 + (p10 - p00) * tx;
    let bottom = p01 + (p11 - p01) * tx;
    (top + (bottom - top) * ty).round().clamp(0.0, 255.0) as u8
}
