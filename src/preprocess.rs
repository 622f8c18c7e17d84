//! Decoding and normalization of uploaded scans.
//!
//! Every upload is turned into a fixed-shape NHWC tensor of `f32` values in
//! `[0, 1]`, which is the input contract of the classifier.

use image::imageops::FilterType;
use serde::Serialize;

/// Side length, in pixels, of the square image fed to the classifier.
pub const IMAGE_SIDE: usize = 128;

/// Number of color channels fed to the classifier.
pub const CHANNELS: usize = 3;

/// Shape of the classifier input: batch, height, width, channels.
pub const INPUT_SHAPE: [usize; 4] = [1, IMAGE_SIDE, IMAGE_SIDE, CHANNELS];

/// Errors raised while turning an upload into a tensor.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported image type: {0}")]
    UnsupportedType(String),
    #[error("the uploaded file is empty")]
    Empty,
    #[error("the uploaded file is not a valid image: {0}")]
    Invalid(#[from] image::ImageError),
}

/// Image formats accepted for upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageMime {
    Png,
    Jpeg,
}

impl ImageMime {
    /// Parses a `Content-Type` value, ignoring parameters such as `charset`.
    pub fn from_content_type(content_type: &str) -> Result<Self, DecodeError> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "image/png" => Ok(ImageMime::Png),
            "image/jpeg" | "image/jpg" => Ok(ImageMime::Jpeg),
            _ => Err(DecodeError::UnsupportedType(content_type.to_string())),
        }
    }

    /// Maps a file extension (`png`, `jpg`, `jpeg`) to a MIME type.
    pub fn from_extension(extension: &str) -> Result<Self, DecodeError> {
        match extension.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageMime::Png),
            "jpg" | "jpeg" => Ok(ImageMime::Jpeg),
            _ => Err(DecodeError::UnsupportedType(extension.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageMime::Png => "image/png",
            ImageMime::Jpeg => "image/jpeg",
        }
    }
}

/// Raw upload as received from the client.
#[derive(Clone, Debug)]
pub struct UploadedImage {
    bytes: Vec<u8>,
    mime: ImageMime,
}

/// Lightweight description of an upload, kept for telemetry once the bytes
/// have been consumed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UploadMetadata {
    pub mime: ImageMime,
    pub byte_len: usize,
}

impl UploadedImage {
    pub fn new(bytes: impl Into<Vec<u8>>, mime: ImageMime) -> Self {
        Self {
            bytes: bytes.into(),
            mime,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> ImageMime {
        self.mime
    }

    pub fn metadata(&self) -> UploadMetadata {
        UploadMetadata {
            mime: self.mime,
            byte_len: self.bytes.len(),
        }
    }
}

/// A `(1, 128, 128, 3)` tensor in row-major NHWC order.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedImageTensor {
    data: Vec<f32>,
}

impl NormalizedImageTensor {
    pub fn shape(&self) -> [usize; 4] {
        INPUT_SHAPE
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[cfg(test)]
    pub(crate) fn blank() -> Self {
        Self {
            data: vec![0.0; INPUT_SHAPE.iter().product()],
        }
    }
}

/// Decodes, converts to RGB, resizes to `IMAGE_SIDE` square and scales the
/// channels into `[0, 1]`.
///
/// The resize stretches the image to a square; the aspect ratio of the scan is
/// not preserved.
pub fn preprocess(upload: &UploadedImage) -> Result<NormalizedImageTensor, DecodeError> {
    if upload.bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let decoded = image::load_from_memory(&upload.bytes)?;
    if decoded.width() != decoded.height() {
        log::debug!(
            "Stretching a {}x{} scan to {}x{}",
            decoded.width(),
            decoded.height(),
            IMAGE_SIDE,
            IMAGE_SIDE
        );
    }

    let rgb = decoded.to_rgb8();
    let resized = image::imageops::resize(
        &rgb,
        IMAGE_SIDE as u32,
        IMAGE_SIDE as u32,
        FilterType::CatmullRom,
    );

    let data = resized
        .into_raw()
        .into_iter()
        .map(|channel| f32::from(channel) / 255.0)
        .collect();

    Ok(NormalizedImageTensor { data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        }))
    }

    fn assert_normalized(tensor: &NormalizedImageTensor) {
        assert_eq!(tensor.shape(), [1, 128, 128, 3]);
        assert_eq!(tensor.as_slice().len(), 128 * 128 * 3);
        assert!(tensor.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn png_of_any_size_is_normalized() {
        for (w, h) in [(1, 1), (64, 64), (128, 128), (300, 200), (17, 513)] {
            let bytes = encode(gradient(w, h), ImageFormat::Png);
            let tensor = preprocess(&UploadedImage::new(bytes, ImageMime::Png)).unwrap();
            assert_normalized(&tensor);
        }
    }

    #[test]
    fn jpeg_is_normalized() {
        let bytes = encode(gradient(200, 150), ImageFormat::Jpeg);
        let tensor = preprocess(&UploadedImage::new(bytes, ImageMime::Jpeg)).unwrap();
        assert_normalized(&tensor);
    }

    #[test]
    fn grayscale_is_expanded_to_rgb() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(40, 40, Luma([255])));
        let bytes = encode(gray, ImageFormat::Png);
        let tensor = preprocess(&UploadedImage::new(bytes, ImageMime::Png)).unwrap();
        assert_normalized(&tensor);
        assert!(tensor.as_slice().iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn alpha_channel_is_dropped() {
        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(32, 32, Rgba([0, 51, 255, 10])));
        let bytes = encode(rgba, ImageFormat::Png);
        let tensor = preprocess(&UploadedImage::new(bytes, ImageMime::Png)).unwrap();
        assert_normalized(&tensor);
        let first = &tensor.as_slice()[..3];
        assert!((first[0] - 0.0).abs() < 1e-6);
        assert!((first[1] - 0.2).abs() < 1e-6);
        assert!((first[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn same_bytes_give_same_tensor() {
        let bytes = encode(gradient(90, 120), ImageFormat::Png);
        let upload = UploadedImage::new(bytes, ImageMime::Png);
        assert_eq!(preprocess(&upload).unwrap(), preprocess(&upload).unwrap());
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let upload = UploadedImage::new(b"definitely not a png".to_vec(), ImageMime::Png);
        assert!(matches!(preprocess(&upload), Err(DecodeError::Invalid(_))));
    }

    #[test]
    fn empty_upload_is_rejected() {
        let upload = UploadedImage::new(Vec::new(), ImageMime::Jpeg);
        assert!(matches!(preprocess(&upload), Err(DecodeError::Empty)));
    }

    #[test]
    fn content_types() {
        assert_eq!(ImageMime::from_content_type("image/png").unwrap(), ImageMime::Png);
        assert_eq!(ImageMime::from_content_type("image/jpg").unwrap(), ImageMime::Jpeg);
        assert_eq!(
            ImageMime::from_content_type("IMAGE/JPEG; charset=binary").unwrap(),
            ImageMime::Jpeg
        );
        assert!(matches!(
            ImageMime::from_content_type("image/gif"),
            Err(DecodeError::UnsupportedType(_))
        ));
        assert_eq!(ImageMime::from_extension("JPEG").unwrap(), ImageMime::Jpeg);
        assert!(ImageMime::from_extension("bmp").is_err());
    }

    #[test]
    fn metadata_does_not_need_the_bytes() {
        let upload = UploadedImage::new(vec![0u8; 42], ImageMime::Png);
        let meta = upload.metadata();
        assert_eq!(meta.byte_len, 42);
        assert_eq!(meta.mime, ImageMime::Png);
    }
}
