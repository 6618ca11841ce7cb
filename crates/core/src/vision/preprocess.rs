use anyhow::{Context, Result, anyhow, ensure};
use candle_core::{Device, Tensor};
use fast_image_resize as fir;
use image::{DynamicImage, ImageBuffer, RgbImage};

/// Channel-major RGB image normalised as `(pixel - mean[c]) * norm[c]`.
#[derive(Debug, Clone)]
pub struct Planes {
    data: Vec<f32>,
    height: usize,
    width: usize,
}

impl Planes {
    pub fn from_rgb(image: &RgbImage, mean: [f32; 3], norm: [f32; 3]) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let plane = height * width;
        let mut data = vec![0f32; 3 * plane];
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            for c in 0..3 {
                data[c * plane + offset] = (pixel[c] as f32 - mean[c]) * norm[c];
            }
        }
        Self {
            data,
            height,
            width,
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    /// `[1, 3, H, W]`
    pub fn into_tensor(self, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(self.data, (1, 3, self.height, self.width), device)
            .context("failed to build pixel tensor")
    }
}

/// Converts to RGB, resizes bilinearly to `width x height` and normalises.
pub fn prepare_planes(
    image: &DynamicImage,
    width: u32,
    height: u32,
    mean: [f32; 3],
    norm: [f32; 3],
) -> Result<Planes> {
    let rgb = image.to_rgb8();
    let resized = if rgb.dimensions() == (width, height) {
        rgb
    } else {
        resize_rgb_image(&rgb, width, height)?
    };
    Ok(Planes::from_rgb(&resized, mean, norm))
}

pub fn resize_rgb_image(image: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    ensure!(
        width > 0 && height > 0,
        "cannot resize image to {width}x{height}"
    );
    ensure!(
        image.width() > 0 && image.height() > 0,
        "cannot resize an empty image"
    );
    let mut src_buf = image.clone().into_raw();
    let src = fir::images::Image::from_slice_u8(
        image.width(),
        image.height(),
        src_buf.as_mut_slice(),
        fir::PixelType::U8x3,
    )
    .context("failed to build fast_image_resize source image")?;
    let mut dst = fir::images::Image::new(width, height, fir::PixelType::U8x3);
    let options =
        fir::ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Bilinear));
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src, &mut dst, &options)
        .map_err(|err| anyhow!("fast_image_resize failed: {err}"))?;
    let buffer = dst.into_vec();
    ImageBuffer::from_raw(width, height, buffer)
        .ok_or_else(|| anyhow!("failed to convert resized buffer into image"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn planes_are_channel_major_and_normalised() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([10, 20, 30]));
        img.put_pixel(1, 0, Rgb([40, 50, 60]));
        let planes = Planes::from_rgb(&img, [10.0, 0.0, 0.0], [1.0, 0.5, 2.0]);
        assert_eq!(planes.at(0, 0, 0), 0.0);
        assert_eq!(planes.at(0, 0, 1), 30.0);
        assert_eq!(planes.at(1, 0, 1), 25.0);
        assert_eq!(planes.at(2, 0, 0), 60.0);
        let tensor = planes.into_tensor(&Device::Cpu).expect("tensor");
        assert_eq!(tensor.dims(), &[1, 3, 1, 2]);
    }

    #[test]
    fn prepare_resizes_constant_image() -> Result<()> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(30, 20, Rgb([100, 100, 100])));
        let planes = prepare_planes(&img, 14, 28, [100.0; 3], [1.0; 3])?;
        assert_eq!((planes.height(), planes.width()), (28, 14));
        assert!(planes.data.iter().all(|v| v.abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn resize_rejects_zero_target() {
        let img = RgbImage::new(4, 4);
        assert!(resize_rgb_image(&img, 0, 4).is_err());
    }
}
