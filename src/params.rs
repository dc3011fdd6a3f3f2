//! Transformation descriptors: parsing, validation and fingerprinting.
//!
//! The URL grammar is `k_v(,k_v)*` over the keys `w` (width), `h` (height),
//! `c` (cropping mode) and `g` (gravity). Scale arrives separately as a
//! trailing `@<n>x` suffix on the image path; filter, watermark and text
//! overlays are only reachable through configured named transformations.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How the requested box relates to the source image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CroppingMode {
    /// Resize to exactly (w, h), ignoring aspect ratio.
    Exact,
    /// Fit the whole image inside (w, h), preserving aspect ratio.
    All,
    /// Fill (w, h): crop the matching-aspect interior rectangle, then resize.
    Part,
    /// Crop a (w, h) window out of the source without resampling.
    KeepScale,
}

impl CroppingMode {
    pub fn code(self) -> &'static str {
        match self {
            CroppingMode::Exact => "e",
            CroppingMode::All => "a",
            CroppingMode::Part => "p",
            CroppingMode::KeepScale => "k",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "e" => Some(CroppingMode::Exact),
            "a" => Some(CroppingMode::All),
            "p" => Some(CroppingMode::Part),
            "k" => Some(CroppingMode::KeepScale),
            _ => None,
        }
    }
}

/// Anchor used when placing a smaller box inside a larger one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gravity {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
    Center,
}

impl Gravity {
    pub fn code(self) -> &'static str {
        match self {
            Gravity::North => "n",
            Gravity::NorthEast => "ne",
            Gravity::East => "e",
            Gravity::SouthEast => "se",
            Gravity::South => "s",
            Gravity::SouthWest => "sw",
            Gravity::West => "w",
            Gravity::NorthWest => "nw",
            Gravity::Center => "c",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "n" => Some(Gravity::North),
            "ne" => Some(Gravity::NorthEast),
            "e" => Some(Gravity::East),
            "se" => Some(Gravity::SouthEast),
            "s" => Some(Gravity::South),
            "sw" => Some(Gravity::SouthWest),
            "w" => Some(Gravity::West),
            "nw" => Some(Gravity::NorthWest),
            "c" => Some(Gravity::Center),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    None,
    GrayScale,
}

impl Filter {
    pub fn code(self) -> &'static str {
        match self {
            Filter::None => "none",
            Filter::GrayScale => "grayscale",
        }
    }
}

/// A watermark image composited over the output.
///
/// `path` is an opaque handle into storage. Negative offsets anchor to the
/// right/bottom edge: `x < 0` places the watermark at
/// `bounds.width - watermark.width + x`, likewise for `y`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub path: String,
    pub x: i32,
    pub y: i32,
}

/// A text overlay composited over the output, after the watermark.
///
/// For `y > 0` the offset names the glyph-run baseline; for `y < 0` the
/// measured extent is reserved from the bottom edge. `x` follows the
/// watermark negativity rule. `size` is in points at 72 DPI, so one point
/// equals one pixel before the output scale is applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextOverlay {
    pub content: String,
    pub font: String,
    pub x: i32,
    pub y: i32,
    pub size: u32,
    pub color: [u8; 4],
}

pub const DEFAULT_CROPPING_MODE: CroppingMode = CroppingMode::Exact;
pub const DEFAULT_GRAVITY: Gravity = Gravity::NorthWest;

/// An immutable transformation descriptor.
///
/// `width`/`height` of 0 mean "unconstrained along that axis", which only
/// `KeepScale` accepts; it clamps to the source dimensions at apply time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub width: u32,
    pub height: u32,
    pub cropping: CroppingMode,
    pub gravity: Gravity,
    pub scale: u32,
    pub filter: Filter,
    pub watermark: Option<Watermark>,
    pub texts: Vec<TextOverlay>,
    /// Name of the configured transformation this descriptor came from, if
    /// any. Participates in the fingerprint only when overlays are present.
    pub name: Option<String>,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            width: 0,
            height: 0,
            cropping: DEFAULT_CROPPING_MODE,
            gravity: DEFAULT_GRAVITY,
            scale: 1,
            filter: Filter::None,
            watermark: None,
            texts: Vec::new(),
            name: None,
        }
    }
}

impl Params {
    /// Parses a custom descriptor string like `w_400,h_300,c_p,g_c`.
    pub fn parse(raw: &str) -> Result<Params, Error> {
        let mut params = Params::default();
        for part in raw.split(',') {
            let (key, value) = part
                .split_once('_')
                .ok_or_else(|| Error::InvalidParameter(part.to_string()))?;
            match key {
                "w" => params.width = parse_dimension(key, value)?,
                "h" => params.height = parse_dimension(key, value)?,
                "c" => {
                    if value.len() != 1 {
                        return Err(Error::InvalidParameter(format!(
                            "value [{key}] must have exactly 1 character"
                        )));
                    }
                    params.cropping = CroppingMode::from_code(&value.to_lowercase())
                        .ok_or_else(|| invalid_value(key, value))?;
                }
                "g" => {
                    if value.is_empty() || value.len() > 2 {
                        return Err(Error::InvalidParameter(format!(
                            "value [{key}] must have 1 or 2 characters"
                        )));
                    }
                    params.gravity = Gravity::from_code(&value.to_lowercase())
                        .ok_or_else(|| invalid_value(key, value))?;
                }
                _ => return Err(Error::InvalidParameter(format!("unknown parameter: {key}"))),
            }
        }
        params.validate()?;
        Ok(params)
    }

    /// Inverse of [`Params::parse`] for the four URL keys.
    pub fn serialize(&self) -> String {
        let mut parts = Vec::new();
        if self.width > 0 {
            parts.push(format!("w_{}", self.width));
        }
        if self.height > 0 {
            parts.push(format!("h_{}", self.height));
        }
        parts.push(format!("c_{}", self.cropping.code()));
        parts.push(format!("g_{}", self.gravity.code()));
        parts.join(",")
    }

    /// Canonical cache key for this descriptor.
    ///
    /// The six known keys always appear, in fixed alphabetical order, so the
    /// fingerprint is stable across processes and releases; a future keyword
    /// may only append when it is non-default. Descriptors carrying overlays
    /// (only reachable through a named transformation) additionally append
    /// the transformation name, so their artifacts never collide with
    /// overlay-free output sharing the same core values.
    pub fn fingerprint(&self) -> String {
        let mut fp = format!(
            "c={},f={},g={},h={},s={},w={}",
            self.cropping.code(),
            self.filter.code(),
            self.gravity.code(),
            self.height,
            self.scale,
            self.width,
        );
        if self.watermark.is_some() || !self.texts.is_empty() {
            if let Some(name) = &self.name {
                fp.push_str(",t=");
                fp.push_str(name);
            }
        }
        fp
    }

    fn validate(&self) -> Result<(), Error> {
        match self.cropping {
            CroppingMode::Exact | CroppingMode::All | CroppingMode::Part => {
                if self.width == 0 || self.height == 0 {
                    return Err(Error::InvalidParameter(format!(
                        "cropping mode [{}] requires both w and h",
                        self.cropping.code()
                    )));
                }
            }
            CroppingMode::KeepScale => {}
        }
        Ok(())
    }
}

fn parse_dimension(key: &str, value: &str) -> Result<u32, Error> {
    let value: u32 = value
        .parse()
        .map_err(|_| Error::InvalidParameter(format!("could not parse value for parameter: {key}")))?;
    if value == 0 {
        return Err(Error::InvalidParameter(format!("value [{key}] must be > 0")));
    }
    Ok(value)
}

fn invalid_value(key: &str, value: &str) -> Error {
    Error::InvalidParameter(format!("invalid value for parameter [{key}]: {value}"))
}

/// Whether `s` has the shape of a named transformation identifier.
pub fn is_transformation_name(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Splits a retina-style scale suffix off the path stem:
/// `cat@2x.jpg` becomes `("cat.jpg", 2)`. Paths without a well-formed
/// suffix come back unchanged with scale 1.
pub fn parse_base_path_and_scale(path: &str) -> (String, u32) {
    let (stem, ext) = match path.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (path, None),
    };
    if let Some(at) = stem.rfind('@') {
        let suffix = &stem[at + 1..];
        if let Some(n) = suffix.strip_suffix('x').and_then(|n| n.parse::<u32>().ok()) {
            if n >= 1 && at > 0 {
                let base = match ext {
                    Some(ext) => format!("{}.{}", &stem[..at], ext),
                    None => stem[..at].to_string(),
                };
                return (base, n);
            }
        }
    }
    (path.to_string(), 1)
}

/// Path of the pre-scaled variant of an image, e.g. `logo.png` at scale 2
/// is `logo@2x.png`.
pub fn path_with_scale(path: &str, scale: u32) -> String {
    if scale <= 1 {
        return path.to_string();
    }
    match path.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}@{scale}x.{ext}"),
        None => format!("{path}@{scale}x"),
    }
}

/// Derived artifact path for a base image and a descriptor fingerprint:
/// `<stem>--<fingerprint>--<ext>`.
pub fn derived_path(base: &str, fingerprint: &str) -> String {
    match base.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}--{fingerprint}--{ext}"),
        None => format!("{base}--{fingerprint}--"),
    }
}

/// The format tag a derived path was encoded with, from its trailing
/// `--<ext>` component.
pub fn derived_ext(derived: &str) -> Option<&str> {
    derived.rsplit_once("--").map(|(_, ext)| ext).filter(|e| !e.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_width_height() {
        let act = Params::parse("w_400,h_300").unwrap();
        let exp = Params {
            width: 400,
            height: 300,
            ..Params::default()
        };
        assert_eq!(act, exp);
    }

    #[test]
    fn parse_cropping_and_gravity() {
        let act = Params::parse("w_200,h_300,c_k,g_c").unwrap();
        let exp = Params {
            width: 200,
            height: 300,
            cropping: CroppingMode::KeepScale,
            gravity: Gravity::Center,
            ..Params::default()
        };
        assert_eq!(act, exp);
    }

    #[test]
    fn parse_rejects_bad_values() {
        assert!(Params::parse("w_abc,h_300").is_err());
        assert!(Params::parse("w_0,h_300").is_err());
        assert!(Params::parse("w_-1,h_300").is_err());
        assert!(Params::parse("w_400,h_300,c_z").is_err());
        assert!(Params::parse("w_400,h_300,c_ee").is_err());
        assert!(Params::parse("w_400,h_300,g_xx").is_err());
        assert!(Params::parse("w_400,h_300,q_50").is_err());
        assert!(Params::parse("nonsense").is_err());
    }

    #[test]
    fn exact_requires_both_dimensions() {
        assert!(Params::parse("w_400").is_err());
        assert!(Params::parse("h_300,c_a").is_err());
        // KeepScale clamps at apply time, so a single axis is fine.
        assert!(Params::parse("w_400,c_k").is_ok());
        assert!(Params::parse("c_k").is_ok());
    }

    #[test]
    fn fingerprint_is_canonical() {
        let params = Params::parse("h_300,w_400").unwrap();
        assert_eq!(params.fingerprint(), "c=e,f=none,g=nw,h=300,s=1,w=400");
    }

    #[test]
    fn fingerprint_round_trips_through_serialize() {
        for raw in ["w_400,h_300", "w_200,h_300,c_k,g_c", "w_16,h_16,c_p,g_se"] {
            let params = Params::parse(raw).unwrap();
            let reparsed = Params::parse(&params.serialize()).unwrap();
            assert_eq!(params.fingerprint(), reparsed.fingerprint());
        }
    }

    #[test]
    fn fingerprint_includes_preset_name_only_with_overlays() {
        let mut params = Params::parse("w_400,h_300").unwrap();
        params.name = Some("thumb".into());
        assert_eq!(params.fingerprint(), "c=e,f=none,g=nw,h=300,s=1,w=400");

        params.watermark = Some(Watermark {
            path: "logo.png".into(),
            x: -10,
            y: -10,
        });
        assert_eq!(params.fingerprint(), "c=e,f=none,g=nw,h=300,s=1,w=400,t=thumb");
    }

    #[test]
    fn scale_suffix() {
        assert_eq!(parse_base_path_and_scale("cat.jpg"), ("cat.jpg".to_string(), 1));
        assert_eq!(parse_base_path_and_scale("cat@2x.jpg"), ("cat.jpg".to_string(), 2));
        assert_eq!(parse_base_path_and_scale("dir/cat@3x.png"), ("dir/cat.png".to_string(), 3));
        // Malformed suffixes are part of the filename.
        assert_eq!(parse_base_path_and_scale("cat@x.jpg"), ("cat@x.jpg".to_string(), 1));
        assert_eq!(parse_base_path_and_scale("cat@0x.jpg"), ("cat@0x.jpg".to_string(), 1));
    }

    #[test]
    fn derived_path_format() {
        let params = Params::parse("w_400,h_300").unwrap();
        let derived = derived_path("cat.jpg", &params.fingerprint());
        assert_eq!(derived, "cat--c=e,f=none,g=nw,h=300,s=1,w=400--jpg");
        assert_eq!(derived_ext(&derived), Some("jpg"));
    }

    #[test]
    fn pre_scaled_variant_path() {
        assert_eq!(path_with_scale("logo.png", 1), "logo.png");
        assert_eq!(path_with_scale("logo.png", 2), "logo@2x.png");
    }

    #[test]
    fn transformation_name_shape() {
        assert!(is_transformation_name("small-square"));
        assert!(is_transformation_name("thumb2"));
        assert!(!is_transformation_name("w_400,h_300"));
        assert!(!is_transformation_name(""));
    }
}
