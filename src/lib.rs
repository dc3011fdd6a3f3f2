//! An HTTP image transformation and delivery service.
//!
//! Clients request a stored source image together with a transformation
//! descriptor (dimensions, cropping mode, gravity, scale, filter, optional
//! watermark and text overlays) and receive the derived image. Derived
//! artifacts are cached in pluggable storage (local directory or S3) with
//! their membership, sizes and access statistics tracked in Redis; a byte
//! budget is enforced by LRU or LFU pruning. A second surface accepts
//! uploads and can pre-materialise a configured set of eager
//! transformations.

pub mod auth;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod metadata;
pub mod params;
pub mod server;
pub mod storage;
pub mod text;
pub mod transform;

pub use crate::cache::CacheManager;
pub use crate::codec::ImageFormat;
pub use crate::config::{CachePolicy, Config, Transformation};
pub use crate::error::Error;
pub use crate::params::{CroppingMode, Filter, Gravity, Params, TextOverlay, Watermark};
pub use crate::server::{App, SharedApp};
pub use crate::storage::Storage;
pub use crate::transform::Engine;
