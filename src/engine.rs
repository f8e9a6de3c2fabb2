//! The derivation engine.
//!
//! [`ImageCache::get`] turns an [`ImageKey`] into a concrete [`ImageFile`]:
//!
//! ```text
//! get(key) ── look in the store ──► hit: return it (successes AND failures)
//!                │
//!                └─ miss ──► build(key)
//!                              ├─ recurse on the inner key
//!                              ├─ run the tool pipeline on bytes from the
//!                              │  byte cache
//!                              ├─ ingest the output (checksum + type)
//!                              ├─ probe pixel metadata
//!                              └─ store the outcome, success or not
//! ```
//!
//! Failed builds are cached too: a derivation that failed stays failed —
//! and cheap — until [`ImageCache::delete`] clears the entry. Identity
//! derivations (a scale that rounds to 1, an all-zero crop, an image that
//! is already upright) return the inner image without writing a blob or
//! spawning anything.
//!
//! Within a process, concurrent `get`s for the same key coalesce: one
//! caller builds, the rest wait on the in-flight slot. Across processes,
//! content addressing makes collisions benign — both writers compute the
//! same blob and the same record.

use crate::config::CacheConfig;
use crate::convert::{Stage, decoder, plan};
use crate::error::{Error, Result};
use crate::filecache::FileCache;
use crate::geometry::{approx, cut_window, format_scale, scale_from_dpi};
use crate::pipeline::{Cmd, ToolRunner, render_pipeline};
use crate::probe::{probe_pnm, probe_type};
use crate::store::Store;
use crate::types::{ImageFile, ImageKey, ImageType, Rotation};
use num_traits::One;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

/// EXIF orientation normalization, supplied by the embedding application.
///
/// The contract: given image bytes, return `Ok(None)` when the image is
/// already upright, `Ok(Some(bytes))` with the re-oriented rendition
/// otherwise. A closure implements the trait directly.
pub trait OrientationNormalizer: Send + Sync {
    fn normalize(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>>;
}

impl<F> OrientationNormalizer for F
where
    F: Fn(&[u8]) -> Result<Option<Vec<u8>>> + Send + Sync,
{
    fn normalize(&self, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        self(bytes)
    }
}

/// A persisted derivation outcome. Success or failure, both are replayed
/// on later requests for the same key.
///
/// Snapshots written before failures were cached stored the `ImageFile`
/// bare; deserialization lifts that legacy form into `Ok`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CachedOutcome(pub std::result::Result<ImageFile, Error>);

impl CachedOutcome {
    fn into_result(self) -> Result<ImageFile> {
        self.0
    }
}

impl From<Result<ImageFile>> for CachedOutcome {
    fn from(result: Result<ImageFile>) -> Self {
        CachedOutcome(result)
    }
}

impl<'de> Deserialize<'de> for CachedOutcome {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Tagged(std::result::Result<ImageFile, Error>),
            Legacy(ImageFile),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Tagged(result) => CachedOutcome(result),
            Repr::Legacy(image) => CachedOutcome(Ok(image)),
        })
    }
}

/// Slot a group of coalesced callers waits on.
struct Flight {
    slot: Mutex<Option<Result<ImageFile>>>,
    ready: Condvar,
}

impl Flight {
    fn new() -> Self {
        Flight {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn set(&self, result: Result<ImageFile>) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<ImageFile> {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.ready.wait(slot).unwrap();
        }
    }
}

/// The cache: byte store, persistent derivation map, tool runner, and the
/// in-process coalescing table.
pub struct ImageCache {
    files: FileCache,
    store: Mutex<Store<ImageKey, CachedOutcome>>,
    runner: Arc<dyn ToolRunner>,
    normalizer: Arc<dyn OrientationNormalizer>,
    in_flight: Mutex<HashMap<ImageKey, Arc<Flight>>>,
}

impl ImageCache {
    /// Open a cache rooted at `cache_top` with its derivation map at
    /// `store_dir`.
    pub fn open(
        cache_top: impl Into<PathBuf>,
        store_dir: impl Into<PathBuf>,
        runner: Arc<dyn ToolRunner>,
        normalizer: Arc<dyn OrientationNormalizer>,
    ) -> Result<Self> {
        Ok(ImageCache {
            files: FileCache::new(cache_top),
            store: Mutex::new(Store::open(store_dir)?),
            runner,
            normalizer,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Open a cache at the locations named by a [`CacheConfig`].
    pub fn open_configured(
        config: &CacheConfig,
        runner: Arc<dyn ToolRunner>,
        normalizer: Arc<dyn OrientationNormalizer>,
    ) -> Result<Self> {
        Self::open(
            &config.paths.cache_top,
            &config.paths.store_dir,
            runner,
            normalizer,
        )
    }

    /// Checkpoint the derivation map and release the cache.
    pub fn close(self) -> Result<()> {
        self.store
            .into_inner()
            .unwrap()
            .close()
            .map_err(|e| e.in_function("ImageCache::close"))
    }

    /// The underlying byte cache.
    pub fn files(&self) -> &FileCache {
        &self.files
    }

    /// Ingest an uploaded image, probing its type and metadata. The result
    /// is what [`ImageKey::Original`] wraps.
    pub fn ingest_original(&self, bytes: &[u8]) -> Result<ImageFile> {
        let runner = self.runner.as_ref();
        let (file, ty) = self
            .files
            .from_bytes(bytes, |p| probe_type(runner, p), |t| t.extension())?;
        probe_pnm(runner, bytes, ty, file)
    }

    /// Ingest an uploaded image from a local path.
    pub fn ingest_original_path(&self, path: &Path) -> Result<ImageFile> {
        let runner = self.runner.as_ref();
        let (file, ty) = self
            .files
            .from_path(path, |p| probe_type(runner, p), |t| t.extension())?;
        let bytes = self.files.load(&file)?;
        probe_pnm(runner, &bytes, ty, file)
    }

    /// Resolve a derivation key to a concrete image.
    ///
    /// Cached outcomes — including cached failures — are returned as-is.
    /// On a miss the key is built, the outcome is persisted, and every
    /// caller waiting on the same key receives the same result.
    pub fn get(&self, key: &ImageKey) -> Result<ImageFile> {
        if let Some(outcome) = self.look(key) {
            return outcome.into_result();
        }

        let (flight, is_owner) = self.join_in_flight(key);
        if !is_owner {
            return flight.wait();
        }

        // The previous owner may have finished between our miss and our
        // claim of the flight; the store is the truth.
        let result = match self.look(key) {
            Some(outcome) => outcome.into_result(),
            None => {
                tracing::debug!(?key, "building derivation");
                let built = self.build(key);
                // the build outcome is what callers get; a failed put only
                // costs a rebuild on some later request
                if let Err(e) = self.put(key, &built) {
                    tracing::warn!(?key, error = %e, "failed to persist derivation outcome");
                }
                built
            }
        };

        self.finish_in_flight(key, &flight, result.clone());
        result
    }

    /// Drop a cached outcome, clearing a negative entry so the derivation
    /// can be retried.
    pub fn delete(&self, key: &ImageKey) -> Result<()> {
        self.store
            .lock()
            .unwrap()
            .delete(key)
            .map_err(|e| e.in_function("ImageCache::delete"))
    }

    fn look(&self, key: &ImageKey) -> Option<CachedOutcome> {
        self.store.lock().unwrap().look(key)
    }

    fn put(&self, key: &ImageKey, result: &Result<ImageFile>) -> Result<()> {
        self.store
            .lock()
            .unwrap()
            .put(key.clone(), CachedOutcome(result.clone()))
            .map_err(|e| e.in_function("ImageCache::get"))
    }

    fn join_in_flight(&self, key: &ImageKey) -> (Arc<Flight>, bool) {
        let mut map = self.in_flight.lock().unwrap();
        if let Some(existing) = map.get(key) {
            return (Arc::clone(existing), false);
        }
        let flight = Arc::new(Flight::new());
        map.insert(key.clone(), Arc::clone(&flight));
        (flight, true)
    }

    fn finish_in_flight(&self, key: &ImageKey, flight: &Arc<Flight>, result: Result<ImageFile>) {
        flight.set(result);
        self.in_flight.lock().unwrap().remove(key);
    }

    /// Structural recursion over the key. Every arm first resolves the
    /// inner key through `get`, so shared sub-derivations are built once
    /// and memoized.
    fn build(&self, key: &ImageKey) -> Result<ImageFile> {
        match key {
            ImageKey::Original(image) => Ok(image.clone()),

            ImageKey::Upright(inner) => {
                let image = self.get(inner)?;
                let bytes = self.files.load(&image.file)?;
                match self
                    .normalizer
                    .normalize(&bytes)
                    .map_err(|e| e.in_function("build(Upright)"))?
                {
                    None => Ok(image),
                    Some(upright) => self.ingest_derived(&upright, "orientation normalized"),
                }
            }

            ImageKey::Scaled(size, dpi, inner) => {
                let image = self.get(inner)?;
                let scale = approx(scale_from_dpi(
                    dpi.value(),
                    size,
                    image.width,
                    image.height,
                )?);
                if scale.is_one() {
                    return Ok(image);
                }
                let cmds = [
                    decoder(image.image_type),
                    Cmd::new("pnmscale").arg(format_scale(scale)),
                    Cmd::new("cjpeg"),
                ];
                let bytes = self.files.load(&image.file)?;
                let scaled = self
                    .runner
                    .run_pipeline(&cmds, &bytes)
                    .map_err(|e| e.in_function("build(Scaled)"))?;
                self.ingest_derived(&scaled, render_pipeline(&cmds))
            }

            ImageKey::Cropped(crop, inner) => {
                let image = self.get(inner)?;

                let mut stages = Vec::new();
                if let Some(window) = cut_window(crop, image.width, image.height)? {
                    let cmd = Cmd::new("pnmcut").args([
                        "-left".to_string(),
                        window.left.to_string(),
                        "-right".to_string(),
                        window.right.to_string(),
                        "-top".to_string(),
                        window.top.to_string(),
                        "-bottom".to_string(),
                        window.bottom.to_string(),
                    ]);
                    stages.push(Stage::new(cmd, ImageType::Ppm, ImageType::Ppm));
                }
                if crop.rotation != Rotation::R0 {
                    let cmd = Cmd::new("jpegtran")
                        .arg("-rotate")
                        .arg(crop.rotation.degrees().to_string());
                    stages.push(Stage::new(cmd, ImageType::Jpeg, ImageType::Jpeg));
                }
                if stages.is_empty() {
                    return Ok(image);
                }

                let cmds = plan(image.image_type, &stages, ImageType::Jpeg);
                let bytes = self.files.load(&image.file)?;
                let cropped = self
                    .runner
                    .run_pipeline(&cmds, &bytes)
                    .map_err(|e| e.in_function("build(Cropped)"))?;
                self.ingest_derived(&cropped, render_pipeline(&cmds))
            }
        }
    }

    /// Ingest derivation output: checksum it into the byte cache, probe its
    /// type and metadata, and note how it was made.
    fn ingest_derived(&self, bytes: &[u8], note: impl Into<String>) -> Result<ImageFile> {
        let runner = self.runner.as_ref();
        let (mut file, ty) = self
            .files
            .from_bytes(bytes, |p| probe_type(runner, p), |t| t.extension())?;
        file.push_message(note.into());
        probe_pnm(runner, bytes, ty, file)
    }
}

/// Open a cache, run `body`, then checkpoint and close on every exit path.
/// The body's error wins over a close failure.
pub fn with_cache<T>(
    cache_top: impl Into<PathBuf>,
    store_dir: impl Into<PathBuf>,
    runner: Arc<dyn ToolRunner>,
    normalizer: Arc<dyn OrientationNormalizer>,
    body: impl FnOnce(&ImageCache) -> Result<T>,
) -> Result<T> {
    let cache = ImageCache::open(cache_top, store_dir, runner, normalizer)?;
    let result = body(&cache);
    let closed = cache.close();
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::MockRunner;
    use crate::types::{Dim, Dpi, ImageCrop, ImageSize, Units};
    use num_rational::Ratio;
    use tempfile::TempDir;

    // Fake image payloads the scripted runner understands.
    const PNG_SRC: &[u8] = b"PNGSRC";
    const JPEG_SRC: &[u8] = b"JPEGSRC";
    const DERIVED: &[u8] = b"DERIVEDJPEG";

    /// Runner that answers `file`, `pnmfile`, and derivation pipelines for
    /// the fake payloads above. `file -b <path>` reads the blob to decide,
    /// exactly like the real tool would.
    fn scripted_runner() -> MockRunner {
        MockRunner::new(|cmds, input| {
            let first = &cmds[0];
            let last = cmds.last().unwrap();
            if first.program() == "file" {
                let path = &first.argv()[1];
                let bytes = std::fs::read(path).map_err(Error::io)?;
                let report = match bytes.as_slice() {
                    PNG_SRC => "PNG image data, 32 x 16, 8-bit/color RGB\n",
                    JPEG_SRC => "JPEG image data, JFIF standard 1.01\n",
                    DERIVED => "JPEG image data, JFIF standard 1.01\n",
                    _ => "data\n",
                };
                return Ok(report.as_bytes().to_vec());
            }
            if last.program() == "pnmfile" {
                let report = match input {
                    PNG_SRC => "stdin:\tPPM raw, 32 by 16  maxval 255\n",
                    JPEG_SRC => "stdin:\tPPM raw, 640 by 480  maxval 255\n",
                    DERIVED => "stdin:\tPPM raw, 14 by 28  maxval 255\n",
                    _ => "stdin: not a pnm\n",
                };
                return Ok(report.as_bytes().to_vec());
            }
            Ok(DERIVED.to_vec())
        })
    }

    fn upright_noop() -> Arc<dyn OrientationNormalizer> {
        Arc::new(|_: &[u8]| -> Result<Option<Vec<u8>>> { Ok(None) })
    }

    struct Fixture {
        _tmp: TempDir,
        cache_top: PathBuf,
        store_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let cache_top = tmp.path().join("blobs");
            let store_dir = tmp.path().join("state");
            Fixture {
                _tmp: tmp,
                cache_top,
                store_dir,
            }
        }

        fn open(&self, runner: Arc<MockRunner>) -> ImageCache {
            ImageCache::open(&self.cache_top, &self.store_dir, runner, upright_noop()).unwrap()
        }

        fn open_with(
            &self,
            runner: Arc<MockRunner>,
            normalizer: Arc<dyn OrientationNormalizer>,
        ) -> ImageCache {
            ImageCache::open(&self.cache_top, &self.store_dir, runner, normalizer).unwrap()
        }

        fn blob_count(&self) -> usize {
            match std::fs::read_dir(&self.cache_top) {
                Ok(entries) => entries.count(),
                Err(_) => 0,
            }
        }
    }

    fn area_size(hundredths: i64) -> ImageSize {
        ImageSize {
            dim: Dim::Area,
            size: Ratio::new(hundredths, 100),
            units: Units::Inches,
        }
    }

    // =========================================================================
    // Identity derivations
    // =========================================================================

    #[test]
    fn original_resolves_to_itself_with_no_side_effects() {
        let fixture = Fixture::new();
        let runner = Arc::new(scripted_runner());
        let cache = fixture.open(Arc::clone(&runner));

        let img = crate::types::tests::sample_image(
            "00000000000000000000000000000000",
            ImageType::Jpeg,
            640,
            480,
        );
        let key = ImageKey::Original(img.clone());

        assert_eq!(cache.get(&key).unwrap(), img);
        assert!(runner.calls().is_empty());
        assert_eq!(fixture.blob_count(), 0);
    }

    #[test]
    fn scale_that_rounds_to_one_returns_inner_unchanged() {
        let fixture = Fixture::new();
        let runner = Arc::new(scripted_runner());
        let cache = fixture.open(Arc::clone(&runner));

        // 640x480 at 100 dpi occupies exactly 30.72 in²
        let img = crate::types::tests::sample_image(
            "00000000000000000000000000000000",
            ImageType::Jpeg,
            640,
            480,
        );
        let key = ImageKey::scaled(
            area_size(3072),
            Dpi::from_integer(100),
            ImageKey::Original(img.clone()),
        );

        assert_eq!(cache.get(&key).unwrap(), img);
        assert!(runner.calls().is_empty());
        assert_eq!(fixture.blob_count(), 0);
    }

    #[test]
    fn zero_crop_returns_inner_unchanged() {
        let fixture = Fixture::new();
        let runner = Arc::new(scripted_runner());
        let cache = fixture.open(Arc::clone(&runner));

        let img = crate::types::tests::sample_image(
            "00000000000000000000000000000000",
            ImageType::Png,
            32,
            16,
        );
        let crop = ImageCrop {
            top: 0,
            bottom: 0,
            left: 0,
            right: 0,
            rotation: Rotation::R0,
        };
        let key = ImageKey::cropped(crop, ImageKey::Original(img.clone()));

        assert_eq!(cache.get(&key).unwrap(), img);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn already_upright_image_passes_through() {
        let fixture = Fixture::new();
        let runner = Arc::new(scripted_runner());
        let cache = fixture.open(Arc::clone(&runner));

        let img = cache.ingest_original(JPEG_SRC).unwrap();
        let calls_after_ingest = runner.calls().len();

        let key = ImageKey::upright(ImageKey::Original(img.clone()));
        assert_eq!(cache.get(&key).unwrap(), img);
        // loading the blob is a file read, not a subprocess
        assert_eq!(runner.calls().len(), calls_after_ingest);
    }

    #[test]
    fn upright_ingests_normalized_bytes() {
        let fixture = Fixture::new();
        let runner = Arc::new(scripted_runner());
        let normalizer: Arc<dyn OrientationNormalizer> =
            Arc::new(|_: &[u8]| -> Result<Option<Vec<u8>>> { Ok(Some(DERIVED.to_vec())) });
        let cache = fixture.open_with(Arc::clone(&runner), normalizer);

        let img = cache.ingest_original(JPEG_SRC).unwrap();
        let key = ImageKey::upright(ImageKey::Original(img.clone()));
        let upright = cache.get(&key).unwrap();

        assert_ne!(upright, img);
        assert_eq!(upright.image_type, ImageType::Jpeg);
        assert_eq!((upright.width, upright.height), (14, 28));
        assert_eq!(
            upright.file.checksum,
            crate::filecache::checksum_hex(DERIVED)
        );
    }

    // =========================================================================
    // Real derivations
    // =========================================================================

    #[test]
    fn scaled_runs_decoder_pnmscale_cjpeg() {
        let fixture = Fixture::new();
        let runner = Arc::new(scripted_runner());
        let cache = fixture.open(Arc::clone(&runner));

        let img = cache.ingest_original(JPEG_SRC).unwrap();
        assert_eq!((img.width, img.height), (640, 480));

        // 3.2 inches wide at 100 dpi → 320px → scale 1/2
        let size = ImageSize {
            dim: Dim::Width,
            size: Ratio::new(32, 10),
            units: Units::Inches,
        };
        let key = ImageKey::scaled(size, Dpi::from_integer(100), ImageKey::Original(img));
        let scaled = cache.get(&key).unwrap();

        let rendered = runner.rendered_calls();
        assert!(
            rendered.contains(&"jpegtopnm | pnmscale 0.500000 | cjpeg".to_string()),
            "pipelines run: {rendered:?}"
        );
        assert_eq!(scaled.image_type, ImageType::Jpeg);
        assert_eq!(
            scaled.file.messages,
            vec!["jpegtopnm | pnmscale 0.500000 | cjpeg".to_string()]
        );
    }

    #[test]
    fn crop_and_rotate_png_composes_the_expected_pipeline() {
        let fixture = Fixture::new();
        let runner = Arc::new(scripted_runner());
        let cache = fixture.open(Arc::clone(&runner));

        let img = cache.ingest_original(PNG_SRC).unwrap();
        assert_eq!((img.width, img.height), (32, 16));
        assert_eq!(img.image_type, ImageType::Png);

        let crop = ImageCrop {
            top: 1,
            bottom: 1,
            left: 2,
            right: 2,
            rotation: Rotation::R90,
        };
        let key = ImageKey::cropped(crop, ImageKey::Original(img));
        let result = cache.get(&key).unwrap();

        let rendered = runner.rendered_calls();
        assert!(
            rendered.contains(
                &"pngtopnm | pnmcut -left 2 -right 29 -top 1 -bottom 14 | cjpeg | \
                  jpegtran -rotate 90"
                    .to_string()
            ),
            "pipelines run: {rendered:?}"
        );
        // output is JPEG with width/height swapped by the quarter turn
        assert_eq!(result.image_type, ImageType::Jpeg);
        assert_eq!((result.width, result.height), (14, 28));
    }

    #[test]
    fn rotate_only_jpeg_needs_no_conversions() {
        let fixture = Fixture::new();
        let runner = Arc::new(scripted_runner());
        let cache = fixture.open(Arc::clone(&runner));

        let img = cache.ingest_original(JPEG_SRC).unwrap();
        let crop = ImageCrop {
            top: 0,
            bottom: 0,
            left: 0,
            right: 0,
            rotation: Rotation::R180,
        };
        let key = ImageKey::cropped(crop, ImageKey::Original(img));
        cache.get(&key).unwrap();

        let rendered = runner.rendered_calls();
        assert!(
            rendered.contains(&"jpegtran -rotate 180".to_string()),
            "pipelines run: {rendered:?}"
        );
    }

    // =========================================================================
    // Memoization and negative caching
    // =========================================================================

    fn derivation_count(runner: &MockRunner) -> usize {
        runner
            .calls()
            .iter()
            .filter(|(cmds, _)| {
                let last = cmds.last().unwrap().program();
                last == "cjpeg" || last == "jpegtran"
            })
            .count()
    }

    #[test]
    fn second_get_is_served_from_the_store() {
        let fixture = Fixture::new();
        let runner = Arc::new(scripted_runner());
        let cache = fixture.open(Arc::clone(&runner));

        let img = cache.ingest_original(PNG_SRC).unwrap();
        let crop = ImageCrop {
            top: 0,
            bottom: 0,
            left: 4,
            right: 0,
            rotation: Rotation::R0,
        };
        let key = ImageKey::cropped(crop, ImageKey::Original(img));

        let first = cache.get(&key).unwrap();
        assert_eq!(derivation_count(&runner), 1);
        let second = cache.get(&key).unwrap();
        assert_eq!(first, second);
        assert_eq!(derivation_count(&runner), 1);
    }

    #[test]
    fn cached_outcomes_survive_reopen() {
        let fixture = Fixture::new();
        let runner = Arc::new(scripted_runner());

        let key = {
            let cache = fixture.open(Arc::clone(&runner));
            let img = cache.ingest_original(PNG_SRC).unwrap();
            let crop = ImageCrop {
                top: 0,
                bottom: 0,
                left: 4,
                right: 0,
                rotation: Rotation::R0,
            };
            let key = ImageKey::cropped(crop, ImageKey::Original(img));
            cache.get(&key).unwrap();
            cache.close().unwrap();
            key
        };
        assert_eq!(derivation_count(&runner), 1);

        let cache = fixture.open(Arc::clone(&runner));
        cache.get(&key).unwrap();
        assert_eq!(derivation_count(&runner), 1);
        cache.close().unwrap();
    }

    #[test]
    fn failed_builds_are_cached_until_deleted() {
        let fixture = Fixture::new();
        let runner = Arc::new(MockRunner::new(|cmds, input| {
            let first = &cmds[0];
            let last = cmds.last().unwrap();
            if first.program() == "file" {
                return Ok(b"JPEG image data\n".to_vec());
            }
            if last.program() == "pnmfile" && input == JPEG_SRC {
                return Ok(b"stdin:\tPPM raw, 640 by 480  maxval 255\n".to_vec());
            }
            Err(Error::command(
                render_pipeline(cmds),
                "exit status: 2".to_string(),
            ))
        }));
        let cache = fixture.open(Arc::clone(&runner));

        let img = cache.ingest_original(JPEG_SRC).unwrap();
        let size = ImageSize {
            dim: Dim::Width,
            size: Ratio::new(32, 10),
            units: Units::Inches,
        };
        let key = ImageKey::scaled(size, Dpi::from_integer(100), ImageKey::Original(img));

        let first = cache.get(&key).unwrap_err();
        let calls_after_first = runner.calls().len();

        // replayed from the store, pipeline not re-run
        let second = cache.get(&key).unwrap_err();
        assert_eq!(first, second);
        assert_eq!(runner.calls().len(), calls_after_first);

        // clearing the entry allows a retry
        cache.delete(&key).unwrap();
        let _ = cache.get(&key).unwrap_err();
        assert!(runner.calls().len() > calls_after_first);
    }

    #[test]
    fn concurrent_gets_for_one_key_build_once() {
        let fixture = Fixture::new();
        let runner = Arc::new(MockRunner::new(|cmds, input| {
            let first = &cmds[0];
            let last = cmds.last().unwrap();
            if first.program() == "file" {
                let path = &first.argv()[1];
                let bytes = std::fs::read(path).map_err(Error::io)?;
                let report = if bytes == DERIVED {
                    "JPEG image data\n"
                } else {
                    "PNG image data\n"
                };
                return Ok(report.as_bytes().to_vec());
            }
            if last.program() == "pnmfile" {
                let report = if input == DERIVED {
                    "stdin:\tPPM raw, 14 by 28  maxval 255\n"
                } else {
                    "stdin:\tPPM raw, 32 by 16  maxval 255\n"
                };
                return Ok(report.as_bytes().to_vec());
            }
            // slow derivation so the callers genuinely overlap
            std::thread::sleep(std::time::Duration::from_millis(100));
            Ok(DERIVED.to_vec())
        }));
        let cache = fixture.open(Arc::clone(&runner));

        let img = cache.ingest_original(PNG_SRC).unwrap();
        let crop = ImageCrop {
            top: 1,
            bottom: 1,
            left: 2,
            right: 2,
            rotation: Rotation::R90,
        };
        let key = ImageKey::cropped(crop, ImageKey::Original(img));

        let results: Vec<Result<ImageFile>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let cache = &cache;
                    let key = key.clone();
                    scope.spawn(move || cache.get(&key))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let first = results[0].clone().unwrap();
        for result in results {
            assert_eq!(result.unwrap(), first);
        }
        assert_eq!(derivation_count(&runner), 1);
    }

    // =========================================================================
    // with_cache and persisted-outcome forms
    // =========================================================================

    #[test]
    fn with_cache_closes_on_both_paths() {
        let fixture = Fixture::new();
        let runner: Arc<dyn ToolRunner> = Arc::new(scripted_runner());

        let result: Result<()> = with_cache(
            &fixture.cache_top,
            &fixture.store_dir,
            Arc::clone(&runner),
            upright_noop(),
            |_| Err(Error::caller("body failed")),
        );
        assert!(result.is_err());

        // The store was checkpointed and closed despite the failure.
        assert!(fixture.store_dir.join("checkpoint.json").exists());

        with_cache(
            &fixture.cache_top,
            &fixture.store_dir,
            runner,
            upright_noop(),
            |_| Ok(()),
        )
        .unwrap();
    }

    #[test]
    fn open_configured_uses_the_configured_paths() {
        let fixture = Fixture::new();
        let mut config = crate::config::CacheConfig::default();
        config.paths.cache_top = fixture.cache_top.clone();
        config.paths.store_dir = fixture.store_dir.clone();

        let runner = Arc::new(scripted_runner());
        let cache =
            ImageCache::open_configured(&config, runner, upright_noop()).unwrap();
        cache.ingest_original(JPEG_SRC).unwrap();
        cache.close().unwrap();

        assert!(fixture.store_dir.join("checkpoint.json").exists());
        assert!(fixture.blob_count() > 0);
    }

    #[test]
    fn outcome_parses_tagged_success_and_failure() {
        let img = crate::types::tests::sample_image(
            "00112233445566778899aabbccddeeff",
            ImageType::Jpeg,
            10,
            20,
        );
        let ok_json = serde_json::to_string(&CachedOutcome(Ok(img.clone()))).unwrap();
        let back: CachedOutcome = serde_json::from_str(&ok_json).unwrap();
        assert_eq!(back, CachedOutcome(Ok(img.clone())));

        let err_json =
            serde_json::to_string(&CachedOutcome(Err(Error::caller("bad crop")))).unwrap();
        let back: CachedOutcome = serde_json::from_str(&err_json).unwrap();
        assert_eq!(back, CachedOutcome(Err(Error::caller("bad crop"))));
    }

    #[test]
    fn outcome_lifts_legacy_bare_image_to_ok() {
        let img = crate::types::tests::sample_image(
            "00112233445566778899aabbccddeeff",
            ImageType::Jpeg,
            10,
            20,
        );
        // an old snapshot stored the ImageFile with no Ok/Err tag
        let legacy_json = serde_json::to_string(&img).unwrap();
        let back: CachedOutcome = serde_json::from_str(&legacy_json).unwrap();
        assert_eq!(back, CachedOutcome(Ok(img)));
    }
}
