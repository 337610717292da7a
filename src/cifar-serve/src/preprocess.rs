//! Image decoding and normalization into the classifier's input layout.

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageError};

/// Number of color channels fed to the model
pub const CHANNELS: usize = 3;

/// Normalized image in HWC layout with values in `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageTensor {
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl ImageTensor {
    pub fn new(height: usize, width: usize, data: Vec<f32>) -> Option<Self> {
        if data.len() != height * width * CHANNELS {
            return None;
        }

        Some(ImageTensor {
            height,
            width,
            data,
        })
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, CHANNELS)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Decode `bytes` and normalize to a `height × width × 3` tensor.
pub fn preprocess(bytes: &[u8], width: u32, height: u32) -> Result<ImageTensor, ImageError> {
    let image = image::load_from_memory(bytes)?;
    Ok(normalize(&image, width, height))
}

/// Same as [`preprocess`] but reads from disk. The format is guessed from
/// the file content, since object keys do not always carry an extension.
pub fn load(path: &Path, width: u32, height: u32) -> Result<ImageTensor, ImageError> {
    let image = image::io::Reader::open(path)?
        .with_guessed_format()?
        .decode()?;

    Ok(normalize(&image, width, height))
}

/// Drops alpha (or expands gray) to RGB, resizes exactly and scales to `[0, 1]`.
pub fn normalize(image: &DynamicImage, width: u32, height: u32) -> ImageTensor {
    let rgb = image.to_rgb8();
    let resized = image::imageops::resize(&rgb, width, height, FilterType::Triangle);

    let data = resized
        .into_raw()
        .into_iter()
        .map(|x| x as f32 / 255f32)
        .collect();

    ImageTensor {
        height: height as usize,
        width: width as usize,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageOutputFormat, Luma, Rgba};
    use std::io::Cursor;

    fn encode(image: DynamicImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageOutputFormat::Png).unwrap();
        buf.into_inner()
    }

    fn assert_normalized(tensor: &ImageTensor) {
        assert_eq!(tensor.shape(), (32, 32, 3));
        assert_eq!(tensor.data().len(), 32 * 32 * 3);
        assert!(tensor.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn rgba_image_is_flattened_and_resized() {
        let img = ImageBuffer::from_fn(500, 500, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 200, (x / 2 % 256) as u8])
        });
        let bytes = encode(DynamicImage::ImageRgba8(img));

        let tensor = preprocess(&bytes, 32, 32).unwrap();
        assert_normalized(&tensor);
    }

    #[test]
    fn grayscale_image_becomes_three_channels() {
        let img = ImageBuffer::from_pixel(7, 40, Luma([255u8]));
        let bytes = encode(DynamicImage::ImageLuma8(img));

        let tensor = preprocess(&bytes, 32, 32).unwrap();
        assert_normalized(&tensor);
        assert!(tensor.data().iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn solid_color_is_scaled_exactly() {
        let img = ImageBuffer::from_pixel(64, 64, Rgba([255u8, 0, 51, 10]));
        let tensor = normalize(&DynamicImage::ImageRgba8(img), 32, 32);

        let px = &tensor.data()[..3];
        assert!((px[0] - 1.0).abs() < 1e-6);
        assert!(px[1].abs() < 1e-6);
        assert!((px[2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        assert!(preprocess(b"definitely not an image", 32, 32).is_err());
    }

    #[test]
    fn load_guesses_format_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let img = ImageBuffer::from_pixel(10, 10, Rgba([1u8, 2, 3, 255]));
        std::fs::write(&path, encode(DynamicImage::ImageRgba8(img))).unwrap();

        let tensor = load(&path, 32, 32).unwrap();
        assert_normalized(&tensor);
    }

    #[test]
    fn tensor_rejects_wrong_length() {
        assert!(ImageTensor::new(2, 2, vec![0.0; 11]).is_none());
        assert!(ImageTensor::new(2, 2, vec![0.0; 12]).is_some());
    }
}
