pub mod enhance;
pub mod quality;
pub mod roi;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageError, ImageFormat, ImageReader, RgbImage};
use ndarray::{Array2, Array3, ArrayView3, Axis};
use sha2::{Digest, Sha256};
use std::io::Cursor;

use crate::config::{PreprocessConfig, QualityConfig};
pub use quality::{QualityAssessor, QualityIssue, QualityReport};
pub use roi::{DiskDetector, RetinalDisk};

pub const TARGET_SIZE: usize = 224;
pub const CHANNELS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
}

/// Uploaded bytes plus the MIME type the caller declared for them.
#[derive(Debug, Clone)]
pub struct RawImage {
    bytes: Vec<u8>,
    mime_type: String,
}

impl RawImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hex SHA-256 of the payload, used to correlate log lines.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }
}

/// Model input: 224x224x3 (HWC), every value in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor {
    data: Array3<f32>,
}

impl NormalizedTensor {
    pub fn try_from_array(data: Array3<f32>) -> Result<Self, PreprocessError> {
        if data.dim() != (TARGET_SIZE, TARGET_SIZE, CHANNELS) {
            return Err(PreprocessError::UnsupportedFormat(format!(
                "tensor shape {:?}, expected ({TARGET_SIZE}, {TARGET_SIZE}, {CHANNELS})",
                data.dim()
            )));
        }
        if data.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(PreprocessError::UnsupportedFormat(
                "tensor values outside [0, 1]".to_string(),
            ));
        }
        Ok(Self { data })
    }

    /// Bilinear resize to 224x224 and scale to [0, 1].
    pub fn from_rgb(image: &RgbImage) -> Self {
        let size = TARGET_SIZE as u32;
        let resized = if image.dimensions() == (size, size) {
            image.clone()
        } else {
            imageops::resize(image, size, size, FilterType::Triangle)
        };
        let data = Array3::from_shape_fn((TARGET_SIZE, TARGET_SIZE, CHANNELS), |(y, x, c)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Self { data }
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Channel-first copy for backends that expect CHW.
    pub fn to_chw(&self) -> Array3<f32> {
        self.data.view().permuted_axes([2, 0, 1]).as_standard_layout().to_owned()
    }

    /// BT.601 luma in [0, 1].
    pub fn luminance(&self) -> Array2<f32> {
        let r = self.data.index_axis(Axis(2), 0);
        let g = self.data.index_axis(Axis(2), 1);
        let b = self.data.index_axis(Axis(2), 2);
        &r * 0.299 + &g * 0.587 + &b * 0.114
    }
}

/// Everything the later stages need from one preprocessed upload.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub tensor: NormalizedTensor,
    pub quality: QualityReport,
    pub roi: Option<RetinalDisk>,
    /// The decoded image after the ROI crop, before enhancement. Heatmaps
    /// are rendered at this resolution.
    pub display: RgbImage,
}

pub struct Preprocessor {
    config: PreprocessConfig,
    assessor: QualityAssessor,
    detector: DiskDetector,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig, quality: QualityConfig) -> Self {
        let detector = DiskDetector::new(config.roi.clone());
        Self {
            config,
            assessor: QualityAssessor::new(quality),
            detector,
        }
    }

    pub fn preprocess(&self, raw: &RawImage) -> Result<Preprocessed, PreprocessError> {
        let image = decode(raw)?;
        self.preprocess_image(image)
    }

    pub fn preprocess_image(&self, image: DynamicImage) -> Result<Preprocessed, PreprocessError> {
        let rgb = to_canonical_rgb(image)?;
        let quality = self.assessor.assess(&rgb);
        let enhanced = enhance::enhance(&rgb, &self.config);

        let roi = if self.config.roi.enabled {
            self.detector.detect(&rgb)
        } else {
            None
        };

        let (enhanced, display) = match roi {
            Some(disk) => {
                let (x, y, w, h) =
                    disk.crop_rect(rgb.width(), rgb.height(), self.config.roi.padding_ratio);
                log::debug!(
                    "Cropping to retinal disk at ({:.0}, {:.0}) r={:.0}: {}x{}+{}+{}",
                    disk.center_x,
                    disk.center_y,
                    disk.radius,
                    w,
                    h,
                    x,
                    y
                );
                (
                    imageops::crop_imm(&enhanced, x, y, w, h).to_image(),
                    imageops::crop_imm(&rgb, x, y, w, h).to_image(),
                )
            }
            None => (enhanced, rgb),
        };

        let tensor = NormalizedTensor::from_rgb(&enhanced);
        Ok(Preprocessed {
            tensor,
            quality,
            roi,
            display,
        })
    }
}

fn decode(raw: &RawImage) -> Result<DynamicImage, PreprocessError> {
    if raw.is_empty() {
        return Err(PreprocessError::InvalidImage("empty payload".to_string()));
    }
    let reader = ImageReader::new(Cursor::new(raw.bytes()))
        .with_guessed_format()
        .map_err(|e| PreprocessError::InvalidImage(e.to_string()))?;
    let format = reader.format().ok_or_else(|| {
        PreprocessError::InvalidImage("unrecognized image signature".to_string())
    })?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(PreprocessError::UnsupportedFormat(format!(
            "{format:?} content, only PNG and JPEG are accepted"
        )));
    }
    if let Some(declared) = ImageFormat::from_mime_type(raw.mime_type()) {
        if declared != format {
            log::debug!(
                "Declared {} but content sniffs as {:?}",
                raw.mime_type(),
                format
            );
        }
    }
    reader.decode().map_err(|e| match e {
        ImageError::Unsupported(u) => PreprocessError::UnsupportedFormat(u.to_string()),
        other => PreprocessError::InvalidImage(other.to_string()),
    })
}

/// Gray, gray+alpha, RGB and RGBA at 8 or 16 bits become RGB8; alpha is
/// dropped. Float layouts have no fixed white point and are rejected.
fn to_canonical_rgb(image: DynamicImage) -> Result<RgbImage, PreprocessError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessError::InvalidImage("zero-sized image".to_string()));
    }
    match image {
        DynamicImage::ImageRgb8(rgb) => Ok(rgb),
        DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageRgba8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => Ok(image.to_rgb8()),
        other => Err(PreprocessError::UnsupportedFormat(format!(
            "channel layout {:?}",
            other.color()
        ))),
    }
}
