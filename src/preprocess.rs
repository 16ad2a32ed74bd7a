use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::RgbImage;

use crate::error::CaptionError;

pub const BLIP_IMAGE_SIZE: u32 = 384;
pub const BLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const BLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Turns uploaded bytes into the normalized `(3, size, size)` tensor the
/// vision encoder expects.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
    filter: FilterType,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::blip()
    }
}

impl ImagePreprocessor {
    pub fn new(size: u32, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self {
            size,
            mean,
            std,
            filter: FilterType::CatmullRom,
        }
    }

    pub fn blip() -> Self {
        Self::new(BLIP_IMAGE_SIZE, BLIP_MEAN, BLIP_STD)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Decodes any supported format and drops alpha / converts grayscale.
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage, CaptionError> {
        let image = image::load_from_memory(bytes)?;
        Ok(image.to_rgb8())
    }

    pub fn to_tensor(&self, image: &RgbImage, device: &Device) -> candle_core::Result<Tensor> {
        let size = self.size as usize;
        let resized = image::imageops::resize(image, self.size, self.size, self.filter);

        let pixels = Tensor::from_vec(resized.into_raw(), (size, size, 3), device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        let pixels = (pixels / 255.)?;

        let mean = Tensor::new(&self.mean, device)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&self.std, device)?.reshape((3, 1, 1))?;
        pixels.broadcast_sub(&mean)?.broadcast_div(&std)
    }

    pub fn preprocess(&self, bytes: &[u8], device: &Device) -> Result<Tensor, CaptionError> {
        let image = self.decode(bytes)?;
        Ok(self.to_tensor(&image, device)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgb, Rgba, RgbaImage};

    use super::*;

    pub(crate) fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb(color));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn red_png_becomes_normalized_tensor() {
        let pre = ImagePreprocessor::blip();
        let tensor = pre
            .preprocess(&solid_png(64, 64, [255, 0, 0]), &Device::Cpu)
            .unwrap();
        assert_eq!(tensor.dims(), &[3, 384, 384]);

        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let plane = 384 * 384;
        let red = (1.0 - BLIP_MEAN[0]) / BLIP_STD[0];
        let green = (0.0 - BLIP_MEAN[1]) / BLIP_STD[1];
        let blue = (0.0 - BLIP_MEAN[2]) / BLIP_STD[2];
        // one 8-bit level of resampling error is tolerated
        assert!((values[0] - red).abs() < 2e-2);
        assert!((values[plane + 1000] - green).abs() < 2e-2);
        assert!((values[2 * plane + plane - 1] - blue).abs() < 2e-2);
    }

    #[test]
    fn alpha_is_dropped() {
        let image = RgbaImage::from_pixel(10, 20, Rgba([0, 255, 0, 7]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let rgb = ImagePreprocessor::blip().decode(&bytes).unwrap();
        assert_eq!(rgb.dimensions(), (10, 20));
        assert_eq!(rgb.get_pixel(3, 3), &Rgb([0, 255, 0]));
    }

    #[test]
    fn garbage_bytes_are_invalid_image() {
        let err = ImagePreprocessor::blip()
            .preprocess(b"GIF89a but not really", &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, CaptionError::InvalidImage(_)));
    }

    #[test]
    fn custom_size_is_respected() {
        let pre = ImagePreprocessor::new(32, [0.0; 3], [1.0; 3]);
        let tensor = pre
            .preprocess(&solid_png(7, 5, [0, 0, 255]), &Device::Cpu)
            .unwrap();
        assert_eq!(tensor.dims(), &[3, 32, 32]);
        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values[0].abs() < 1e-2);
        assert!((values[2 * 32 * 32] - 1.0).abs() < 1e-2);
    }
}
