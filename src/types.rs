//! Shared types for the cache and the derivation engine.
//!
//! These types are serialized into the persistent store and used as lookup
//! keys, so their equality, ordering, and encoded form must be stable
//! across process restarts and crate versions. Everything derives
//! structural `Ord`/`Eq`/`Hash`, and the serde encoding is the canonical
//! wire form — change it only with a migration path (see [`Dpi`] for the
//! one such migration currently carried).

use crate::error::Error;
use crate::geometry::{Rational, approx, approx_f64};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The image formats the cache understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Ppm,
    Jpeg,
    Gif,
    Png,
}

impl ImageType {
    /// Extension hint used for blob symlinks, leading dot included.
    pub fn extension(self) -> &'static str {
        match self {
            ImageType::Ppm => ".ppm",
            ImageType::Jpeg => ".jpg",
            ImageType::Gif => ".gif",
            ImageType::Png => ".png",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageType::Ppm => "PPM",
            ImageType::Jpeg => "JPEG",
            ImageType::Gif => "GIF",
            ImageType::Png => "PNG",
        };
        f.write_str(name)
    }
}

/// Where a cached blob originally came from. Provenance only; the checksum
/// is the identity.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FileSource {
    Path(PathBuf),
    Uri(String),
    Bytes,
    Command(String),
}

/// A record in the byte cache: a checksum-addressed blob plus provenance.
///
/// The blob stored under `checksum` always has MD5 equal to `checksum`;
/// that invariant holds after every public cache operation. `messages`
/// accumulate human-readable annotations and are never semantically
/// significant.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct File {
    pub source: Option<FileSource>,
    /// Lowercase hex MD5 of the blob bytes; the on-disk name.
    pub checksum: String,
    #[serde(default)]
    pub messages: Vec<String>,
    /// Extension hint (leading dot) or empty.
    #[serde(default)]
    pub ext: String,
}

impl File {
    pub fn push_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }
}

/// A concrete on-disk image: blob identity plus decoded pixel metadata.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ImageFile {
    pub file: File,
    pub image_type: ImageType,
    pub width: u32,
    pub height: u32,
    pub max_val: u32,
}

/// Quarter-turn rotations, the only ones `jpegtran` performs losslessly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u32", try_from = "u32")]
pub enum Rotation {
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Result<Self, Error> {
        match degrees {
            0 => Ok(Rotation::R0),
            90 => Ok(Rotation::R90),
            180 => Ok(Rotation::R180),
            270 => Ok(Rotation::R270),
            other => Err(Error::caller(format!(
                "rotation must be a multiple of 90 in [0, 270], got {other}"
            ))),
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }
}

impl From<Rotation> for u32 {
    fn from(r: Rotation) -> u32 {
        r.degrees()
    }
}

impl TryFrom<u32> for Rotation {
    type Error = Error;

    fn try_from(degrees: u32) -> Result<Self, Error> {
        Rotation::from_degrees(degrees)
    }
}

/// Crop margins in pixels (measured inward from each edge) plus an
/// optional lossless rotation applied after the cut.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ImageCrop {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
    pub rotation: Rotation,
}

/// Which dimension a display size constrains.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Dim {
    Height,
    Width,
    Area,
}

/// Physical units for display sizes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Units {
    Inches,
    Cm,
    Points,
}

/// A requested display size: dimension, magnitude, units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ImageSize {
    pub dim: Dim,
    pub size: Rational,
    pub units: Units,
}

/// A display resolution in dots per inch, held as a small exact rational.
///
/// Earlier key snapshots stored this as a binary float; deserialization
/// accepts both forms, lifting floats through
/// [`approx`](crate::geometry::approx) so an old key compares equal to the
/// rational key a new writer would produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Dpi(Rational);

impl Dpi {
    /// Build from a rational, normalizing through `approx`.
    pub fn new(value: Rational) -> Self {
        Dpi(approx(value))
    }

    pub fn from_integer(value: i64) -> Self {
        Dpi(Rational::from_integer(value))
    }

    pub fn value(self) -> Rational {
        self.0
    }
}

impl fmt::Display for Dpi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Dpi {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // A rational serializes as the tuple (numer, denom); version-1 keys
        // carried a bare float here instead.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Exact(i64, i64),
            Float(f64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Exact(numer, denom) => {
                if denom == 0 {
                    return Err(serde::de::Error::custom("dpi with zero denominator"));
                }
                Ok(Dpi::new(Rational::new(numer, denom)))
            }
            Repr::Float(x) => approx_f64(x)
                .map(Dpi)
                .ok_or_else(|| serde::de::Error::custom(format!("unrepresentable dpi: {x}"))),
        }
    }
}

/// A derivation plan: the structured identity of a cached image.
///
/// Keys are compared and ordered structurally; the variants nest, so a key
/// spells out the whole chain of transformations back to an ingested
/// original. The serialized form of a key is what the persistent store
/// indexes on.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ImageKey {
    /// A concrete, already-ingested upload.
    Original(ImageFile),
    /// Orientation-normalized rendition of the inner result.
    Upright(Box<ImageKey>),
    /// The inner result scaled to a display size at a resolution.
    Scaled(ImageSize, Dpi, Box<ImageKey>),
    /// The inner result cropped and/or rotated.
    Cropped(ImageCrop, Box<ImageKey>),
}

impl ImageKey {
    /// Convenience constructor boxing the inner key.
    pub fn upright(inner: ImageKey) -> Self {
        ImageKey::Upright(Box::new(inner))
    }

    pub fn scaled(size: ImageSize, dpi: Dpi, inner: ImageKey) -> Self {
        ImageKey::Scaled(size, dpi, Box::new(inner))
    }

    pub fn cropped(crop: ImageCrop, inner: ImageKey) -> Self {
        ImageKey::Cropped(crop, Box::new(inner))
    }
}
