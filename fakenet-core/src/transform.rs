use image::{imageops, imageops::FilterType, DynamicImage, Rgb, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// ImageNet channel statistics
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// How an image is brought to `size x size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resize {
    /// Stretch both edges to `size`, used for training and validation.
    Exact,
    /// Scale the longer edge to `size` keeping the aspect ratio, then centre
    /// on a black canvas. Used for the test split.
    Fit,
}

/// Per-sample preprocessing producing `3 x size x size` values in CHW order.
#[derive(Debug, Clone)]
pub struct Transform {
    size: u32,
    resize: Resize,
    flip_prob: f64,
}

impl Transform {
    pub fn train(size: u32, flip_prob: f64) -> Self {
        Self {
            size,
            resize: Resize::Exact,
            flip_prob,
        }
    }

    pub fn valid(size: u32) -> Self {
        Self {
            size,
            resize: Resize::Exact,
            flip_prob: 0.,
        }
    }

    pub fn test(size: u32) -> Self {
        Self {
            size,
            resize: Resize::Fit,
            flip_prob: 0.,
        }
    }

    /// Draw the flip bit for one sample.
    pub fn sample_flip(&self, rng: &mut impl Rng) -> bool {
        self.flip_prob > 0. && rng.gen_bool(self.flip_prob.min(1.))
    }

    /// Returns `None` for an image without pixels.
    pub fn apply(&self, img: &DynamicImage, flip: bool) -> Option<Vec<f32>> {
        if img.width() == 0 || img.height() == 0 {
            return None;
        }
        let rgb = to_rgb(img);
        let mut rgb = match self.resize {
            Resize::Exact => imageops::resize(&rgb, self.size, self.size, FilterType::Triangle),
            Resize::Fit => fit(&rgb, self.size),
        };
        if flip {
            imageops::flip_horizontal_in_place(&mut rgb);
        }
        Some(normalize(&rgb))
    }
}

/// Grayscale is replicated to three channels, alpha is dropped.
fn to_rgb(img: &DynamicImage) -> RgbImage {
    match img.color().channel_count() {
        1 | 2 => {
            let luma = img.to_luma8();
            RgbImage::from_fn(luma.width(), luma.height(), |x, y| {
                let l = luma.get_pixel(x, y)[0];
                Rgb([l, l, l])
            })
        }
        _ => img.to_rgb8(),
    }
}

fn fit(img: &RgbImage, size: u32) -> RgbImage {
    let half = (size / 2) as i64;
    let factor = img.height().max(img.width()) as f64 / size as f64;
    let nheight = ((img.height() as f64 / factor) as u32).clamp(1, size);
    let nwidth = ((img.width() as f64 / factor) as u32).clamp(1, size);
    let resized = imageops::resize(img, nwidth, nheight, FilterType::Triangle);
    let mut background = RgbImage::new(size, size);
    imageops::overlay(
        &mut background,
        &resized,
        half - (nwidth / 2) as i64,
        half - (nheight / 2) as i64,
    );
    background
}

fn normalize(img: &RgbImage) -> Vec<f32> {
    let plane = (img.width() * img.height()) as usize;
    let mut out = vec![0.; 3 * plane];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = (pixel[c] as f32 / 255. - MEAN[c]) / STD[c];
        }
    }
    out
}
