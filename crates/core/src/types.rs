use anyhow::{bail, Result};
use ndarray::{s, Array4};
use serde::{Deserialize, Serialize};

/// Value range convention of a tensor-backed image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Normalization {
    /// `[0, 1]`, used by most FP16 models (AnimeJaNai, CUGAN).
    #[default]
    #[serde(rename = "zero_to_one")]
    ZeroToOne,
    /// `[0, 255]`, used by Real-ESRGAN FP32 exports.
    #[serde(rename = "zero_to_255")]
    ZeroTo255,
    /// `[-1, 1]`, used by VAE encoders.
    #[serde(rename = "minus_one_to_one")]
    MinusOneToOne,
}

impl Normalization {
    pub fn range(self) -> (f32, f32) {
        match self {
            Self::ZeroToOne => (0.0, 1.0),
            Self::ZeroTo255 => (0.0, 255.0),
            Self::MinusOneToOne => (-1.0, 1.0),
        }
    }

    /// Linearly remap `value` from this convention into `to`.
    pub fn convert(self, value: f32, to: Normalization) -> f32 {
        if self == to {
            return value;
        }
        let (lo, hi) = self.range();
        let (to_lo, to_hi) = to.range();
        to_lo + (value - lo) / (hi - lo) * (to_hi - to_lo)
    }
}

impl std::fmt::Display for Normalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroToOne => write!(f, "0..1"),
            Self::ZeroTo255 => write!(f, "0..255"),
            Self::MinusOneToOne => write!(f, "-1..1"),
        }
    }
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> usize {
        self.x + self.width
    }

    pub fn bottom(&self) -> usize {
        self.y + self.height
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn scaled(&self, factor: usize) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
        }
    }

    pub fn intersection_area(&self, other: &Rect) -> usize {
        let w = self.right().min(other.right()).saturating_sub(self.x.max(other.x));
        let h = self
            .bottom()
            .min(other.bottom())
            .saturating_sub(self.y.max(other.y));
        w * h
    }
}

/// An NCHW `[1, C, H, W]` float image tagged with its value range.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    tensor: Array4<f32>,
    normalization: Normalization,
}

impl Image {
    pub fn from_tensor(tensor: Array4<f32>, normalization: Normalization) -> Result<Self> {
        let shape = tensor.shape();
        if shape[0] != 1 {
            bail!("image tensor must have batch size 1, got shape {shape:?}");
        }
        if shape[1] == 0 || shape[2] == 0 || shape[3] == 0 {
            bail!("image tensor must have non-empty channels and spatial dims, got {shape:?}");
        }
        Ok(Self {
            tensor,
            normalization,
        })
    }

    pub fn zeros(
        channels: usize,
        height: usize,
        width: usize,
        normalization: Normalization,
    ) -> Result<Self> {
        Self::from_tensor(Array4::zeros((1, channels, height, width)), normalization)
    }

    pub fn width(&self) -> usize {
        self.tensor.shape()[3]
    }

    pub fn height(&self) -> usize {
        self.tensor.shape()[2]
    }

    pub fn channels(&self) -> usize {
        self.tensor.shape()[1]
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width(), self.height())
    }

    pub fn tensor(&self) -> &Array4<f32> {
        &self.tensor
    }

    pub fn into_tensor(self) -> Array4<f32> {
        self.tensor
    }

    /// Copy `rect` out of the image as a contiguous `[1, C, h, w]` tensor in `target` range.
    pub fn region_tensor(&self, rect: &Rect, target: Normalization) -> Result<Array4<f32>> {
        if rect.width == 0 || rect.height == 0 {
            bail!("region {rect:?} is empty");
        }
        if rect.right() > self.width() || rect.bottom() > self.height() {
            bail!(
                "region {rect:?} exceeds image bounds {}x{}",
                self.width(),
                self.height()
            );
        }

        let region = self
            .tensor
            .slice(s![.., .., rect.y..rect.bottom(), rect.x..rect.right()]);
        let from = self.normalization;
        if from == target {
            Ok(region.to_owned())
        } else {
            Ok(region.mapv(|v| from.convert(v, target)))
        }
    }

    pub fn renormalized(&self, target: Normalization) -> Image {
        if self.normalization == target {
            return self.clone();
        }
        let from = self.normalization;
        Image {
            tensor: self.tensor.mapv(|v| from.convert(v, target)),
            normalization: target,
        }
    }

    /// Interleaved HWC RGB24 → `[1, 3, H, W]` in `[0, 1]`.
    pub fn from_rgb8(data: &[u8], width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("image dimensions must be non-zero, got {width}x{height}");
        }
        let expected = width * height * 3;
        if data.len() != expected {
            bail!(
                "RGB data length mismatch: expected {expected} ({width}x{height}x3), got {}",
                data.len()
            );
        }

        let mut tensor = Array4::<f32>::zeros((1, 3, height, width));
        for y in 0..height {
            for x in 0..width {
                let src = (y * width + x) * 3;
                for c in 0..3 {
                    tensor[[0, c, y, x]] = data[src + c] as f32 / 255.0;
                }
            }
        }

        Ok(Self {
            tensor,
            normalization: Normalization::ZeroToOne,
        })
    }

    /// `[1, 3, H, W]` → interleaved HWC RGB24, clamping out-of-range values.
    pub fn to_rgb8(&self) -> Result<Vec<u8>> {
        if self.channels() != 3 {
            bail!(
                "RGB export requires 3 channels, image has {}",
                self.channels()
            );
        }
        let (h, w) = (self.height(), self.width());
        let from = self.normalization;

        let mut rgb = vec![0u8; h * w * 3];
        for y in 0..h {
            for x in 0..w {
                let dst = (y * w + x) * 3;
                for c in 0..3 {
                    let unit = from.convert(self.tensor[[0, c, y, x]], Normalization::ZeroTo255);
                    rgb[dst + c] = unit.round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        Ok(rgb)
    }
}

/// Video stream metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub frame_count: u64,
}

impl VideoInfo {
    pub fn with_dimensions(self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..self
        }
    }
}

/// A fully buffered video: metadata plus frames in presentation order.
#[derive(Debug, Clone, PartialEq)]
pub struct Video {
    pub info: VideoInfo,
    pub frames: Vec<Image>,
}

impl Video {
    pub fn new(info: VideoInfo, frames: Vec<Image>) -> Self {
        Self { info, frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(channels: usize, height: usize, width: usize) -> Image {
        let tensor = Array4::from_shape_fn((1, channels, height, width), |(_, c, y, x)| {
            (c * 100 + y * 10 + x) as f32
        });
        Image::from_tensor(tensor, Normalization::ZeroTo255).expect("valid tensor")
    }

    #[test]
    fn test_normalization_convert() {
        assert_eq!(
            Normalization::ZeroToOne.convert(0.5, Normalization::ZeroTo255),
            127.5
        );
        assert_eq!(
            Normalization::ZeroTo255.convert(255.0, Normalization::ZeroToOne),
            1.0
        );
        assert_eq!(
            Normalization::ZeroToOne.convert(0.0, Normalization::MinusOneToOne),
            -1.0
        );
        assert_eq!(
            Normalization::MinusOneToOne.convert(0.0, Normalization::ZeroToOne),
            0.5
        );
    }

    #[test]
    fn test_zeros_rejects_empty_dims() {
        let image = Image::zeros(3, 2, 5, Normalization::ZeroTo255).expect("image");
        assert_eq!((image.width(), image.height(), image.channels()), (5, 2, 3));
        assert!(image.tensor().iter().all(|v| *v == 0.0));
        assert!(Image::zeros(3, 0, 5, Normalization::ZeroToOne).is_err());
        assert!(Image::zeros(0, 2, 2, Normalization::ZeroToOne).is_err());
    }

    #[test]
    fn test_normalization_serde() {
        let json = serde_json::to_string(&Normalization::ZeroTo255).expect("serialize");
        assert_eq!(json, "\"zero_to_255\"");
        let decoded: Normalization = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, Normalization::ZeroTo255);
    }

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0, 0, 4, 4);
        let b = Rect::new(2, 2, 4, 4);
        let c = Rect::new(4, 0, 4, 4);
        assert_eq!(a.intersection_area(&b), 4);
        assert_eq!(a.intersection_area(&c), 0);
        assert_eq!(a.scaled(3), Rect::new(0, 0, 12, 12));
    }

    #[test]
    fn test_from_tensor_rejects_batches() {
        let tensor = Array4::<f32>::zeros((2, 3, 4, 4));
        assert!(Image::from_tensor(tensor, Normalization::ZeroToOne).is_err());
    }

    #[test]
    fn test_region_tensor_copies_sub_rectangle() {
        let image = gradient(3, 6, 10);
        let region = image
            .region_tensor(&Rect::new(8, 4, 2, 2), Normalization::ZeroTo255)
            .expect("region in bounds");
        assert_eq!(region.shape(), &[1, 3, 2, 2]);
        assert_eq!(region[[0, 0, 0, 0]], 48.0);
        assert_eq!(region[[0, 2, 1, 1]], 259.0);
    }

    #[test]
    fn test_region_tensor_converts_range() {
        let image = Image::from_rgb8(&[255, 0, 51], 1, 1).expect("1x1 image");
        let region = image
            .region_tensor(&image.bounds(), Normalization::ZeroTo255)
            .expect("full region");
        assert_eq!(region[[0, 0, 0, 0]], 255.0);
        assert_eq!(region[[0, 1, 0, 0]], 0.0);
        assert!((region[[0, 2, 0, 0]] - 51.0).abs() < 1e-3);
    }

    #[test]
    fn test_region_tensor_out_of_bounds() {
        let image = gradient(1, 4, 4);
        let err = image
            .region_tensor(&Rect::new(2, 2, 4, 1), Normalization::ZeroTo255)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds image bounds"));
    }

    #[test]
    fn test_rgb8_roundtrip() {
        let data: Vec<u8> = (0..2 * 3 * 3).map(|v| (v * 13) as u8).collect();
        let image = Image::from_rgb8(&data, 3, 2).expect("rgb image");
        assert_eq!(image.width(), 3);
        assert_eq!(image.height(), 2);
        assert_eq!(image.channels(), 3);
        assert_eq!(image.to_rgb8().expect("rgb export"), data);
    }

    #[test]
    fn test_to_rgb8_clamps() {
        let tensor = Array4::from_shape_vec((1, 3, 1, 1), vec![-0.5, 0.5, 1.5]).expect("shape");
        let image = Image::from_tensor(tensor, Normalization::ZeroToOne).expect("image");
        assert_eq!(image.to_rgb8().expect("rgb export"), vec![0, 128, 255]);
    }

    #[test]
    fn test_from_rgb8_length_mismatch() {
        let err = Image::from_rgb8(&[0u8; 5], 2, 1).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }

    #[test]
    fn test_video_info_with_dimensions() {
        let info = VideoInfo {
            width: 4,
            height: 4,
            frame_rate: 23.976,
            frame_count: 3,
        };
        let scaled = info.with_dimensions(8, 8);
        assert_eq!(scaled.width, 8);
        assert_eq!(scaled.height, 8);
        assert_eq!(scaled.frame_rate, 23.976);
        assert_eq!(scaled.frame_count, 3);
    }
}
