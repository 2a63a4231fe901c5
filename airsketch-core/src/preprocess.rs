//! Sketch to ControlNet conditioning image.

use image::{imageops::FilterType, DynamicImage, GrayImage, Luma, RgbImage};

/// Side length of the square conditioning image the pipeline is built for.
pub const CONDITIONING_SIZE: u32 = 512;

/// Canny hysteresis thresholds tuned for line art.
pub const CANNY_LOW: f32 = 100.0;
pub const CANNY_HIGH: f32 = 200.0;

/// Luminance -> canny -> invert -> RGB -> Lanczos resize to 512x512.
///
/// A sketch without edges yields a uniform white image.
pub fn conditioning_image(sketch: &DynamicImage) -> RgbImage {
    let gray = sketch.to_luma8();
    let mut edges: GrayImage = imageproc::edges::canny(&gray, CANNY_LOW, CANNY_HIGH);
    for Luma([v]) in edges.pixels_mut() {
        *v = 255 - *v;
    }
    let rgb = DynamicImage::ImageLuma8(edges).to_rgb8();
    image::imageops::resize(
        &rgb,
        CONDITIONING_SIZE,
        CONDITIONING_SIZE,
        FilterType::Lanczos3,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn square_sketch(width: u32, height: u32) -> DynamicImage {
        let mut img = image::RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
        let (x0, y0, x1, y1) = (width / 4, height / 4, 3 * width / 4, 3 * height / 4);
        for x in x0..x1 {
            for y in y0..y1 {
                img.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn output_is_always_512_square_rgb() {
        for (w, h) in [(8, 8), (64, 48), (512, 512), (800, 300), (37, 1024)] {
            let out = conditioning_image(&square_sketch(w, h));
            assert_eq!(out.dimensions(), (CONDITIONING_SIZE, CONDITIONING_SIZE), "{w}x{h}");
            assert_eq!(out.as_raw().len(), (CONDITIONING_SIZE * CONDITIONING_SIZE * 3) as usize);
        }
    }

    #[test]
    fn identical_input_gives_identical_output() {
        let sketch = square_sketch(300, 200);
        assert_eq!(conditioning_image(&sketch).as_raw(), conditioning_image(&sketch).as_raw());
    }

    #[test]
    fn blank_sketch_is_near_uniform_white() {
        let blank = DynamicImage::ImageRgb8(RgbImage::from_pixel(256, 256, image::Rgb([255; 3])));
        let out = conditioning_image(&blank);
        assert!(out.pixels().all(|p| p.0.iter().all(|&c| c >= 250)));
    }

    #[test]
    fn strokes_become_dark_lines_on_light_background() {
        let out = conditioning_image(&square_sketch(512, 512));
        let dark = out.pixels().filter(|p| p.0[0] < 128).count();
        let total = (CONDITIONING_SIZE * CONDITIONING_SIZE) as usize;
        assert!(dark > 0, "square outline should produce edge pixels");
        assert!(dark < total / 4, "edges should be thin, got {dark} dark pixels");
        assert_eq!(out.get_pixel(0, 0).0, [255, 255, 255]);
        for p in out.pixels() {
            assert!(p.0[0] == p.0[1] && p.0[1] == p.0[2]);
        }
    }
}
