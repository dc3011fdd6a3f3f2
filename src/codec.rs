//! Bytes ↔ raster bridge over the `image` crate, restricted to the formats
//! the service stores.

use std::io::Cursor;

use image::{DynamicImage, ImageOutputFormat};

use crate::error::Error;

pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Format tag of a stored blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Filename extension used in storage paths; note `jpeg` shortens to `jpg`.
    pub fn ext(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            _ => None,
        }
    }
}

/// Decodes raw bytes, sniffing the format from the payload.
pub fn decode(bytes: &[u8]) -> Result<(DynamicImage, ImageFormat), Error> {
    let sniffed = image::guess_format(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    let format = match sniffed {
        image::ImageFormat::Jpeg => ImageFormat::Jpeg,
        image::ImageFormat::Png => ImageFormat::Png,
        other => return Err(Error::Decode(format!("unsupported format: {other:?}"))),
    };
    let img = image::load_from_memory_with_format(bytes, sniffed)
        .map_err(|e| Error::Decode(e.to_string()))?;
    Ok((img, format))
}

/// Encodes a raster for the given format. JPEG honours `jpeg_quality`
/// (1..=100); PNG is lossless and ignores it.
pub fn encode(img: &DynamicImage, format: ImageFormat, jpeg_quality: u8) -> Result<Vec<u8>, Error> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            // The JPEG encoder has no alpha channel to write into.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            rgb.write_to(&mut buf, ImageOutputFormat::Jpeg(jpeg_quality))
                .map_err(|e| Error::Encode(e.to_string()))?;
        }
        ImageFormat::Png => {
            img.write_to(&mut buf, ImageOutputFormat::Png)
                .map_err(|e| Error::Encode(e.to_string()))?;
        }
    }
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn checkerboard(w: u32, h: u32) -> DynamicImage {
        let img = RgbaImage::from_fn(w, h, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([40, 80, 120, 255])
            }
        });
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn png_round_trip() {
        let img = checkerboard(8, 6);
        let bytes = encode(&img, ImageFormat::Png, DEFAULT_JPEG_QUALITY).unwrap();
        let (decoded, format) = decode(&bytes).unwrap();
        assert_eq!(format, ImageFormat::Png);
        assert_eq!((decoded.width(), decoded.height()), (8, 6));
    }

    #[test]
    fn jpeg_round_trip() {
        let img = checkerboard(16, 16);
        let bytes = encode(&img, ImageFormat::Jpeg, 90).unwrap();
        let (decoded, format) = decode(&bytes).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[test]
    fn encode_is_deterministic() {
        let img = checkerboard(12, 12);
        let a = encode(&img, ImageFormat::Jpeg, DEFAULT_JPEG_QUALITY).unwrap();
        let b = encode(&img, ImageFormat::Jpeg, DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"not an image at all").is_err());
    }

    #[test]
    fn extension_mapping() {
        assert_eq!(ImageFormat::Jpeg.ext(), "jpg");
        assert_eq!(ImageFormat::from_ext("jpeg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_ext("gif"), None);
    }
}
