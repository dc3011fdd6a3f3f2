//! Text renderer collaborator seam.
//!
//! Font loading and glyph rasterisation live outside the core; the engine
//! only needs to measure a glyph run and receive its raster for compositing.

use image::RgbaImage;

use crate::error::Error;

/// Measures and rasterises glyph runs at 72 DPI, so a pixel size of `px`
/// corresponds to a point size of `px`.
pub trait TextRenderer: Send + Sync {
    /// (width, height) of the glyph run in pixels.
    fn measure(&self, text: &str, font: &str, px: u32) -> Result<(u32, u32), Error>;

    /// Rasterises the glyph run onto a transparent background.
    fn render(&self, text: &str, font: &str, px: u32, color: [u8; 4]) -> Result<RgbaImage, Error>;
}

/// Renderer for deployments without a font backend: measures every run as
/// empty, so overlays become no-ops instead of errors.
pub struct DisabledTextRenderer;

impl TextRenderer for DisabledTextRenderer {
    fn measure(&self, _text: &str, _font: &str, _px: u32) -> Result<(u32, u32), Error> {
        Ok((0, 0))
    }

    fn render(&self, _text: &str, _font: &str, _px: u32, _color: [u8; 4]) -> Result<RgbaImage, Error> {
        Ok(RgbaImage::new(0, 0))
    }
}
