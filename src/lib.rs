//! # Darkroom
//!
//! A persistent, content-addressed cache of image files and their
//! derivations. Callers name the image they want by an [`ImageKey`] — an
//! upload, or a chain of transformations over one (orientation-normalize,
//! scale to a display size at a resolution, crop and rotate) — and get back
//! a concrete file on disk realising that key. Derivations are performed
//! by the standard external tools (Netpbm, libjpeg's `cjpeg`/`jpegtran`),
//! never by decoding pixels in-process.
//!
//! # Architecture: Two Cache Layers and an Engine
//!
//! ```text
//! caller ─► engine.get(key) ─► store.look(key)
//!                                 │ hit  → ImageFile (or the cached failure)
//!                                 │ miss → build(key)
//!                                            ├─ recurse on the inner key
//!                                            ├─ pipeline (F) over bytes from
//!                                            │  the byte cache (C)
//!                                            ├─ ingest output bytes (C)
//!                                            ├─ probe metadata (G)
//!                                            └─ store.put(key, outcome)
//! ```
//!
//! - The **byte cache** ([`filecache`]) stores every blob under the hex MD5
//!   of its bytes. Identical content is stored once; writers race benignly.
//! - The **derivation map** ([`store`]) persists `ImageKey → outcome` as a
//!   checkpoint plus a replayed journal. Failures are cached too.
//! - The **engine** ([`engine`]) walks keys depth-first, memoizes through
//!   the map, and coalesces concurrent requests for the same key.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`types`] | `ImageKey`, `ImageFile`, `File` and friends — the serialized data model |
//! | [`geometry`] | Pure math: rational approximation, units, scale factors, crop windows |
//! | [`error`] | The crate-wide [`Error`] taxonomy with nesting context decorators |
//! | [`filecache`] | Content-addressed blob store with extension symlinks |
//! | [`store`] | Journaled persistent key→value map, scoped open/close |
//! | [`pipeline`] | External command descriptors and the [`ToolRunner`] seam |
//! | [`convert`] | Format-conversion planning through the PPM hub |
//! | [`probe`] | Image type and pixel metadata via `file` and `pnmfile` |
//! | [`engine`] | The derivation engine: get → build → memoize |
//! | [`config`] | Optional `darkroom.toml` for cache locations |
//!
//! # Design Decisions
//!
//! ## External Tools Over In-Process Decoding
//!
//! Every pixel operation shells out to battle-tested converters with PPM as
//! the lingua franca between stages. The crate's job is orchestration:
//! composing pipelines, classifying failures, and never losing track of
//! what produced which bytes.
//!
//! ## Checksums Are the Only Identity
//!
//! Blobs are named by content, so "is this already cached?" is a pure
//! function of bytes, re-ingestion is idempotent, and cross-process races
//! resolve themselves — everyone computing the same derivation writes the
//! same blob.
//!
//! ## Failures Are Cached Values
//!
//! A derivation that failed once will fail again; rerunning the pipeline on
//! every request would turn one bad upload into a load problem. Negative
//! entries persist until explicitly deleted.
//!
//! ## Exact Rationals in Keys
//!
//! Sizes and resolutions are `Ratio<i64>` approximated to four significant
//! digits, not floats: keys must be reproducible across machines, and
//! float drift would fracture the cache.

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod filecache;
pub mod geometry;
pub mod pipeline;
pub mod probe;
pub mod store;
pub mod types;

pub use config::CacheConfig;
pub use engine::{CachedOutcome, ImageCache, OrientationNormalizer, with_cache};
pub use error::{Error, Result};
pub use filecache::{FileCache, UriFetcher};
pub use pipeline::{Cmd, ProcessRunner, ToolRunner};
pub use store::{Store, with_store};
pub use types::{
    Dim, Dpi, File, FileSource, ImageCrop, ImageFile, ImageKey, ImageSize, ImageType, Rotation,
    Units,
};
