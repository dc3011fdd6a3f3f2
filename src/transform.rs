//! The transformation engine: crop/resize, gravity placement, grayscale,
//! watermark composition and text overlays, in that fixed order.

use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView};

use crate::codec;
use crate::error::Error;
use crate::params::{self, CroppingMode, Filter, Gravity, Params, TextOverlay, Watermark};
use crate::storage::Storage;
use crate::text::TextRenderer;

/// Applies transformation descriptors to decoded rasters.
///
/// Storage is needed to resolve watermark sources; text rasterisation is
/// delegated to the [`TextRenderer`] collaborator.
#[derive(Clone)]
pub struct Engine {
    storage: Arc<dyn Storage>,
    text: Arc<dyn TextRenderer>,
}

impl Engine {
    pub fn new(storage: Arc<dyn Storage>, text: Arc<dyn TextRenderer>) -> Self {
        Engine { storage, text }
    }

    /// Runs the full pipeline. Deterministic: the same source and descriptor
    /// always produce the same raster.
    pub async fn apply(&self, img: DynamicImage, params: &Params) -> Result<DynamicImage, Error> {
        let (mut width, mut height) = (params.width, params.height);
        if params.cropping != CroppingMode::KeepScale {
            width = width.saturating_mul(params.scale);
            height = height.saturating_mul(params.scale);
        }

        let mut out = crop_and_resize(img, width, height, params.cropping, params.gravity);

        if params.filter == Filter::GrayScale {
            out = DynamicImage::ImageRgba8(out.grayscale().to_rgba8());
        }

        if let Some(watermark) = &params.watermark {
            out = self.apply_watermark(out, watermark, params.scale).await?;
        }

        for overlay in &params.texts {
            out = self.apply_text(out, overlay, params.scale)?;
        }

        Ok(out)
    }

    async fn apply_watermark(
        &self,
        img: DynamicImage,
        watermark: &Watermark,
        scale: u32,
    ) -> Result<DynamicImage, Error> {
        let raster = self.load_watermark(&watermark.path, scale).await?;
        let (bounds_w, bounds_h) = img.dimensions();
        let (mark_w, mark_h) = raster.dimensions();
        let x = anchor(watermark.x, mark_w, bounds_w);
        let y = anchor(watermark.y, mark_h, bounds_h);

        let mut base = img.to_rgba8();
        imageops::overlay(&mut base, &raster.to_rgba8(), x, y);
        Ok(DynamicImage::ImageRgba8(base))
    }

    /// Resolves the watermark raster, preferring a pre-scaled variant
    /// (`logo@2x.png`) and upscaling the base image when none exists.
    async fn load_watermark(&self, path: &str, scale: u32) -> Result<DynamicImage, Error> {
        if scale > 1 {
            let scaled_path = params::path_with_scale(path, scale);
            if self.storage.exists(&scaled_path).await {
                let bytes = self.storage.get(&scaled_path).await?;
                let (img, _) = codec::decode(&bytes)?;
                return Ok(img);
            }
        }

        let bytes = self.storage.get(path).await?;
        let (img, _) = codec::decode(&bytes)?;
        if scale > 1 {
            let (w, h) = img.dimensions();
            Ok(img.resize_exact(
                w.saturating_mul(scale),
                h.saturating_mul(scale),
                FilterType::Triangle,
            ))
        } else {
            Ok(img)
        }
    }

    fn apply_text(
        &self,
        img: DynamicImage,
        overlay: &TextOverlay,
        scale: u32,
    ) -> Result<DynamicImage, Error> {
        let px = overlay.size.saturating_mul(scale);
        let (run_w, run_h) = self.text.measure(&overlay.content, &overlay.font, px)?;
        if run_w == 0 || run_h == 0 {
            return Ok(img);
        }

        let (bounds_w, bounds_h) = img.dimensions();
        let x = anchor(overlay.x, run_w, bounds_w);
        // Positive y names the baseline; negative y reserves the run extent
        // from the bottom edge.
        let y = if overlay.y < 0 {
            bounds_h as i64 - run_h as i64 + overlay.y as i64
        } else {
            overlay.y as i64 - run_h as i64
        };

        let raster = self
            .text
            .render(&overlay.content, &overlay.font, px, overlay.color)?;
        let mut base = img.to_rgba8();
        imageops::overlay(&mut base, &raster, x, y);
        Ok(DynamicImage::ImageRgba8(base))
    }
}

/// Resolves an offset against an edge: negative offsets anchor to the far
/// edge, `outer - inner + offset`.
fn anchor(offset: i32, inner: u32, outer: u32) -> i64 {
    if offset < 0 {
        outer as i64 - inner as i64 + offset as i64
    } else {
        offset as i64
    }
}

/// Crop/resize dispatch on the cropping mode.
pub fn crop_and_resize(
    img: DynamicImage,
    width: u32,
    height: u32,
    cropping: CroppingMode,
    gravity: Gravity,
) -> DynamicImage {
    let (src_w, src_h) = img.dimensions();
    match cropping {
        CroppingMode::Exact => img.resize_exact(width, height, FilterType::Triangle),
        CroppingMode::All => {
            // Fit inside (w, h); the untouched axis falls out of the ratio.
            img.resize(width, height, FilterType::Triangle)
        }
        CroppingMode::Part => {
            // Interior rectangle of the source whose aspect matches (w, h).
            let (rect_w, rect_h) =
                if width as u64 * src_h as u64 > height as u64 * src_w as u64 {
                    // Whole width shown, height cropped.
                    (src_w, (src_w as u64 * height as u64 / width as u64) as u32)
                } else {
                    // Whole height shown, width cropped.
                    ((src_h as u64 * width as u64 / height as u64) as u32, src_h)
                };
            let (x, y) = gravity_point(gravity, rect_w, rect_h, src_w, src_h);
            img.crop_imm(x, y, rect_w, rect_h)
                .resize_exact(width, height, FilterType::Triangle)
        }
        CroppingMode::KeepScale => {
            // Clamp to the source; 0 means unconstrained.
            let win_w = if width == 0 { src_w } else { width.min(src_w) };
            let win_h = if height == 0 { src_h } else { height.min(src_h) };
            let (x, y) = gravity_point(gravity, win_w, win_h, src_w, src_h);
            img.crop_imm(x, y, win_w, win_h)
        }
    }
}

/// Top-left point of a (w, h) box placed inside (outer_w, outer_h).
///
/// Callers must have clamped: w <= outer_w and h <= outer_h.
pub fn gravity_point(gravity: Gravity, w: u32, h: u32, outer_w: u32, outer_h: u32) -> (u32, u32) {
    debug_assert!(w <= outer_w && h <= outer_h);
    let center_x = (outer_w - w) / 2;
    let center_y = (outer_h - h) / 2;
    let right = outer_w - w;
    let bottom = outer_h - h;
    match gravity {
        Gravity::NorthWest => (0, 0),
        Gravity::North => (center_x, 0),
        Gravity::NorthEast => (right, 0),
        Gravity::East => (right, center_y),
        Gravity::SouthEast => (right, bottom),
        Gravity::South => (center_x, bottom),
        Gravity::SouthWest => (0, bottom),
        Gravity::West => (0, center_y),
        Gravity::Center => (center_x, center_y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ImageFormat;
    use crate::storage::LocalStorage;
    use image::{Rgba, RgbaImage};

    fn solid(w: u32, h: u32, color: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba(color)))
    }

    /// Fixed-advance stub: every glyph is px/2 wide, runs are px tall.
    struct BoxTextRenderer;

    impl TextRenderer for BoxTextRenderer {
        fn measure(&self, text: &str, _font: &str, px: u32) -> Result<(u32, u32), Error> {
            Ok((text.chars().count() as u32 * px / 2, px))
        }

        fn render(&self, text: &str, font: &str, px: u32, color: [u8; 4]) -> Result<RgbaImage, Error> {
            let (w, h) = self.measure(text, font, px)?;
            Ok(RgbaImage::from_pixel(w, h, Rgba(color)))
        }
    }

    fn engine_with(storage: LocalStorage) -> Engine {
        Engine::new(Arc::new(storage), Arc::new(BoxTextRenderer))
    }

    fn engine_and_dir() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(LocalStorage::new(dir.path()));
        (dir, engine)
    }

    #[test]
    fn gravity_table() {
        let cases = [
            (Gravity::North, (200, 0)),
            (Gravity::NorthEast, (400, 0)),
            (Gravity::East, (400, 150)),
            (Gravity::SouthEast, (400, 300)),
            (Gravity::South, (200, 300)),
            (Gravity::SouthWest, (0, 300)),
            (Gravity::West, (0, 150)),
            (Gravity::NorthWest, (0, 0)),
            (Gravity::Center, (200, 150)),
        ];
        for (gravity, expected) in cases {
            assert_eq!(
                gravity_point(gravity, 400, 300, 800, 600),
                expected,
                "{gravity:?}"
            );
        }
    }

    #[tokio::test]
    async fn exact_ignores_aspect_ratio() {
        let (_dir, engine) = engine_and_dir();
        let params = Params::parse("w_400,h_300").unwrap();
        let out = engine.apply(solid(800, 600, [9, 9, 9, 255]), &params).await.unwrap();
        assert_eq!(out.dimensions(), (400, 300));

        let params = Params::parse("w_50,h_200").unwrap();
        let out = engine.apply(solid(800, 600, [9, 9, 9, 255]), &params).await.unwrap();
        assert_eq!(out.dimensions(), (50, 200));
    }

    #[tokio::test]
    async fn all_fits_inside_preserving_aspect() {
        let (_dir, engine) = engine_and_dir();
        let params = Params::parse("w_400,h_300,c_a").unwrap();
        let out = engine.apply(solid(800, 600, [9, 9, 9, 255]), &params).await.unwrap();
        assert_eq!(out.dimensions(), (400, 300));

        // Wide source limited by width: 400x300 box, 1000x500 source.
        let params = Params::parse("w_400,h_300,c_a").unwrap();
        let out = engine.apply(solid(1000, 500, [9, 9, 9, 255]), &params).await.unwrap();
        assert_eq!(out.dimensions(), (400, 200));
    }

    #[tokio::test]
    async fn part_fills_and_center_crops() {
        let (_dir, engine) = engine_and_dir();
        let params = Params::parse("w_300,h_300,c_p,g_c").unwrap();
        let out = engine.apply(solid(800, 600, [9, 9, 9, 255]), &params).await.unwrap();
        assert_eq!(out.dimensions(), (300, 300));
    }

    #[test]
    fn part_crops_the_matching_aspect_rectangle() {
        // 800x600 source filling a 300x300 box keeps the whole height and
        // crops the width to 600; centre gravity starts at x = 100.
        let mut img = RgbaImage::from_pixel(800, 600, Rgba([0, 0, 0, 255]));
        for y in 0..600 {
            for x in 100..700 {
                img.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        let out = crop_and_resize(
            DynamicImage::ImageRgba8(img),
            300,
            300,
            CroppingMode::Part,
            Gravity::Center,
        );
        assert_eq!(out.dimensions(), (300, 300));
        // The extracted window is exactly the white band.
        assert_eq!(out.to_rgba8().get_pixel(150, 150), &Rgba([255, 255, 255, 255]));
        assert_eq!(out.to_rgba8().get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
    }

    #[tokio::test]
    async fn keep_scale_clamps_and_never_resamples() {
        let (_dir, engine) = engine_and_dir();
        let params = Params::parse("w_100,h_20,c_k").unwrap();
        let out = engine.apply(solid(50, 40, [9, 9, 9, 255]), &params).await.unwrap();
        assert_eq!(out.dimensions(), (50, 20));

        // Unconstrained axes fall back to the source dimension.
        let params = Params::parse("w_30,c_k,g_se").unwrap();
        let out = engine.apply(solid(50, 40, [9, 9, 9, 255]), &params).await.unwrap();
        assert_eq!(out.dimensions(), (30, 40));
    }

    #[tokio::test]
    async fn scale_lifts_output_dimensions() {
        let (_dir, engine) = engine_and_dir();
        let mut params = Params::parse("w_10,h_10").unwrap();
        params.scale = 2;
        let out = engine.apply(solid(40, 40, [9, 9, 9, 255]), &params).await.unwrap();
        assert_eq!(out.dimensions(), (20, 20));

        // KeepScale ignores the lift.
        let mut params = Params::parse("w_10,h_10,c_k").unwrap();
        params.scale = 2;
        let out = engine.apply(solid(40, 40, [9, 9, 9, 255]), &params).await.unwrap();
        assert_eq!(out.dimensions(), (10, 10));
    }

    #[tokio::test]
    async fn grayscale_flattens_channels() {
        let (_dir, engine) = engine_and_dir();
        let mut params = Params::parse("w_4,h_4").unwrap();
        params.filter = Filter::GrayScale;
        let out = engine.apply(solid(4, 4, [200, 30, 90, 255]), &params).await.unwrap();
        let pixel = out.to_rgba8().get_pixel(0, 0).0;
        assert_eq!(pixel[0], pixel[1]);
        assert_eq!(pixel[1], pixel[2]);
    }

    #[tokio::test]
    async fn watermark_anchors_bottom_right_with_negative_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let mark = codec::encode(&solid(10, 10, [255, 0, 0, 255]), ImageFormat::Png, 75).unwrap();
        storage.put("logo.png", &mark, "image/png").await.unwrap();
        let engine = engine_with(LocalStorage::new(dir.path()));

        let mut params = Params::parse("w_100,h_100").unwrap();
        params.watermark = Some(Watermark { path: "logo.png".into(), x: -1, y: -1 });
        let out = engine.apply(solid(100, 100, [0, 0, 0, 255]), &params).await.unwrap();
        let rgba = out.to_rgba8();
        // Placed at (100-10-1, 100-10-1) = (89, 89), spanning to (98, 98).
        assert_eq!(rgba.get_pixel(89, 89), &Rgba([255, 0, 0, 255]));
        assert_eq!(rgba.get_pixel(98, 98), &Rgba([255, 0, 0, 255]));
        assert_eq!(rgba.get_pixel(99, 99), &Rgba([0, 0, 0, 255]));
        assert_eq!(rgba.get_pixel(88, 88), &Rgba([0, 0, 0, 255]));
    }

    #[tokio::test]
    async fn watermark_prefers_pre_scaled_variant() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let base = codec::encode(&solid(10, 10, [255, 0, 0, 255]), ImageFormat::Png, 75).unwrap();
        let scaled = codec::encode(&solid(20, 20, [0, 255, 0, 255]), ImageFormat::Png, 75).unwrap();
        storage.put("logo.png", &base, "image/png").await.unwrap();
        storage.put("logo@2x.png", &scaled, "image/png").await.unwrap();
        let engine = engine_with(LocalStorage::new(dir.path()));

        let mut params = Params::parse("w_50,h_50").unwrap();
        params.scale = 2;
        params.watermark = Some(Watermark { path: "logo.png".into(), x: 0, y: 0 });
        let out = engine.apply(solid(100, 100, [0, 0, 0, 255]), &params).await.unwrap();
        let rgba = out.to_rgba8();
        assert_eq!(rgba.get_pixel(0, 0), &Rgba([0, 255, 0, 255]));
        // The pre-scaled raster is 20x20.
        assert_eq!(rgba.get_pixel(19, 19), &Rgba([0, 255, 0, 255]));
        assert_eq!(rgba.get_pixel(20, 20), &Rgba([0, 0, 0, 255]));
    }

    #[tokio::test]
    async fn watermark_upscales_when_no_variant_exists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let base = codec::encode(&solid(10, 10, [255, 0, 0, 255]), ImageFormat::Png, 75).unwrap();
        storage.put("logo.png", &base, "image/png").await.unwrap();
        let engine = engine_with(LocalStorage::new(dir.path()));

        let mut params = Params::parse("w_50,h_50").unwrap();
        params.scale = 2;
        params.watermark = Some(Watermark { path: "logo.png".into(), x: 0, y: 0 });
        let out = engine.apply(solid(100, 100, [0, 0, 0, 255]), &params).await.unwrap();
        let rgba = out.to_rgba8();
        assert_eq!(rgba.get_pixel(19, 19), &Rgba([255, 0, 0, 255]));
        assert_eq!(rgba.get_pixel(20, 20), &Rgba([0, 0, 0, 255]));
    }

    #[tokio::test]
    async fn text_overlay_baseline_and_bottom_anchoring() {
        let (_dir, engine) = engine_and_dir();
        let mut params = Params::parse("w_100,h_100").unwrap();
        params.texts = vec![TextOverlay {
            content: "ab".into(),
            font: "sans".into(),
            x: 5,
            y: 20,
            size: 10,
            color: [0, 0, 255, 255],
        }];
        let out = engine.apply(solid(100, 100, [0, 0, 0, 255]), &params).await.unwrap();
        let rgba = out.to_rgba8();
        // Run measures 10x10; baseline 20 puts the box top at y = 10.
        assert_eq!(rgba.get_pixel(5, 10), &Rgba([0, 0, 255, 255]));
        assert_eq!(rgba.get_pixel(5, 9), &Rgba([0, 0, 0, 255]));

        let mut params = Params::parse("w_100,h_100").unwrap();
        params.texts = vec![TextOverlay {
            content: "ab".into(),
            font: "sans".into(),
            x: -2,
            y: -5,
            size: 10,
            color: [0, 0, 255, 255],
        }];
        let out = engine.apply(solid(100, 100, [0, 0, 0, 255]), &params).await.unwrap();
        let rgba = out.to_rgba8();
        // Box of 10x10 at (100-10-2, 100-10-5) = (88, 85).
        assert_eq!(rgba.get_pixel(88, 85), &Rgba([0, 0, 255, 255]));
        assert_eq!(rgba.get_pixel(87, 84), &Rgba([0, 0, 0, 255]));
    }

    #[tokio::test]
    async fn apply_is_deterministic() {
        let (_dir, engine) = engine_and_dir();
        let params = Params::parse("w_40,h_30,c_p,g_c").unwrap();
        let source = {
            let img = RgbaImage::from_fn(80, 60, |x, y| {
                Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
            });
            DynamicImage::ImageRgba8(img)
        };
        let a = engine.apply(source.clone(), &params).await.unwrap();
        let b = engine.apply(source, &params).await.unwrap();
        let bytes_a = codec::encode(&a, ImageFormat::Png, 75).unwrap();
        let bytes_b = codec::encode(&b, ImageFormat::Png, 75).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }
}
