//! Text-safe transport encoding for raster images: base64, optionally behind a
//! `data:<mime>;base64,` prefix.

use std::io::Cursor;

use anyhow::Result;
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;

use crate::GenerateError;

pub const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// Strips an optional data-URI header (everything up to and including the first comma).
pub fn strip_data_uri(payload: &str) -> &str {
    match payload.split_once(',') {
        Some((_, data)) => data,
        None => payload,
    }
}

pub fn decode_image(payload: &str) -> Result<DynamicImage, GenerateError> {
    let data = strip_data_uri(payload.trim());
    let bytes = BASE64_STANDARD
        .decode(data.trim())
        .map_err(|e| GenerateError::Decode(format!("payload is not valid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(GenerateError::Decode("payload is empty".to_string()));
    }
    image::load_from_memory(&bytes)
        .map_err(|e| GenerateError::Decode(format!("payload is not a supported image: {e}")))
}

pub fn image_to_png_bytes(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

/// Encodes an image as a PNG data URI.
pub fn encode_png_data_uri(img: &DynamicImage) -> Result<String> {
    let bytes = image_to_png_bytes(img)?;
    Ok(format!("{PNG_DATA_URI_PREFIX}{}", BASE64_STANDARD.encode(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DynamicImage {
        let mut img = image::RgbImage::from_pixel(7, 5, image::Rgb([255, 255, 255]));
        img.put_pixel(3, 2, image::Rgb([10, 20, 30]));
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn strip_data_uri_cuts_at_first_comma() {
        assert_eq!(strip_data_uri("data:image/png;base64,AAAA"), "AAAA");
        assert_eq!(strip_data_uri("AAAA"), "AAAA");
        assert_eq!(strip_data_uri("a,b,c"), "b,c");
    }

    #[test]
    fn decodes_with_and_without_prefix() {
        let uri = encode_png_data_uri(&sample()).unwrap();
        assert!(uri.starts_with(PNG_DATA_URI_PREFIX));

        let with_prefix = decode_image(&uri).unwrap();
        let bare = decode_image(strip_data_uri(&uri)).unwrap();
        assert_eq!(with_prefix.to_rgb8(), sample().to_rgb8());
        assert_eq!(bare.to_rgb8(), with_prefix.to_rgb8());
    }

    #[test]
    fn rejects_non_base64_and_non_image_payloads() {
        assert!(matches!(decode_image("not base64 !!"), Err(GenerateError::Decode(_))));
        let text = BASE64_STANDARD.encode(b"hello, not an image");
        assert!(matches!(decode_image(&text), Err(GenerateError::Decode(_))));
        assert!(matches!(decode_image("data:image/png;base64,"), Err(GenerateError::Decode(_))));
    }
}
