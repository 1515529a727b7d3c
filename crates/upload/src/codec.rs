//! Page image normalisation.
//!
//! Every page is stored as an RGB JPEG, whatever it was uploaded as.

use crate::error::{ErrorKind, Rejection, Result};
use exn::ResultExt;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;

/// Decode an uploaded file into RGB pixels.
///
/// An undecodable file is the uploader's problem: it is rejected as
/// [`Rejection::NotAnImage`] naming `name`.
pub fn decode(data: &[u8], name: &str) -> Result<RgbImage> {
    let image = image::load_from_memory(data).or_raise(|| ErrorKind::from(Rejection::NotAnImage(name.to_string())))?;
    Ok(image.to_rgb8())
}

/// Decode a page that was already normalised and stored by us. A failure
/// here is ours, not the uploader's.
pub fn decode_stored(data: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg).or_raise(|| ErrorKind::Image)?;
    Ok(image.to_rgb8())
}

pub fn encode(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg = Vec::new();
    image
        .write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, quality))
        .or_raise(|| ErrorKind::Image)?;
    Ok(jpeg)
}

/// Decode any supported image and re-encode it as an RGB JPEG.
pub fn normalize(data: &[u8], name: &str, quality: u8) -> Result<Vec<u8>> {
    encode(&decode(data, name)?, quality)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    /// A PNG with a solid colour, for feeding the pipelines.
    pub(crate) fn png(width: u32, height: u32, colour: [u8; 3]) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb(colour));
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_normalize_produces_rgb_jpeg() {
        let jpeg = normalize(&png(16, 24, [200, 40, 40]), "1.png", 90).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
        let decoded = decode_stored(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (16, 24));
        let Rgb([r, g, b]) = *decoded.get_pixel(8, 12);
        // JPEG is lossy, solid colours survive within a small tolerance.
        assert!(r.abs_diff(200) < 8 && g.abs_diff(40) < 8 && b.abs_diff(40) < 8);
    }

    #[test]
    fn test_alpha_is_dropped() {
        let image = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 0]));
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        let decoded = decode_stored(&normalize(buffer.get_ref(), "a.png", 90).unwrap()).unwrap();
        assert_eq!(decoded.dimensions(), (4, 4));
    }

    #[test]
    fn test_garbage_is_rejected_by_name() {
        let err = normalize(b"definitely not a picture", "cover.png", 75).unwrap_err();
        assert_eq!(*err, ErrorKind::Invalid(Rejection::NotAnImage("cover.png".to_string())));
    }

    #[test]
    fn test_stored_garbage_is_internal() {
        let err = decode_stored(b"nope").unwrap_err();
        assert_eq!(*err, ErrorKind::Image);
    }
}
