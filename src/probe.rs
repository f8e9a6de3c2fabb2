//! Decoded-metadata probing via `file` and `pnmfile`.
//!
//! The cache never decodes pixels in-process; it asks the system tools.
//! [`probe_type`] classifies a blob by running `file -b` against it, and
//! [`probe_pnm`] reads pixel dimensions by piping the blob through its
//! decoder into `pnmfile` and parsing the one-line report.

use crate::convert::decoder;
use crate::error::{Error, Result};
use crate::pipeline::{Cmd, ToolRunner};
use crate::types::{File, ImageFile, ImageType};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// `file -b` output patterns, checked in order; first match wins.
static TYPE_PATTERNS: LazyLock<Vec<(Regex, ImageType)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r#"Netpbm P[BGP]M "rawbits" image data$"#).unwrap(),
            ImageType::Ppm,
        ),
        (Regex::new(r"JPEG image data").unwrap(), ImageType::Jpeg),
        (Regex::new(r"PNG image data").unwrap(), ImageType::Png),
        (Regex::new(r"GIF image data").unwrap(), ImageType::Gif),
    ]
});

/// `pnmfile` report line: `stdin:\tPPM raw, 640 by 480  maxval 255`.
/// Bitmap (PBM) reports omit the maxval clause.
static PNMFILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^stdin:\tP[PGB]M raw, (\d+) by (\d+)( +maxval (\d+))?$").unwrap()
});

/// Identify the image type of the blob at `path` by running `file -b`.
pub fn probe_type(runner: &dyn ToolRunner, path: &Path) -> Result<ImageType> {
    let cmd = Cmd::new("file").arg("-b").arg_path(path);
    let stdout = runner
        .run_pipeline(&[cmd], b"")
        .map_err(|e| e.in_function("probe_type"))?;
    let report = String::from_utf8_lossy(&stdout);
    let report = report.trim_end();

    for (pattern, ty) in TYPE_PATTERNS.iter() {
        if pattern.is_match(report) {
            return Ok(*ty);
        }
    }
    Err(Error::caller(format!("not an image: {report}")).in_function("probe_type"))
}

/// Read pixel metadata for `bytes` (known to be of `image_type`) and attach
/// it to `file`, producing a complete [`ImageFile`].
///
/// The bytes go through `decoder | pnmfile`. `pnmfile` only needs the PNM
/// header, so it may close its input long before the decoder finishes
/// writing; the runner treats that early close as benign and the decoder's
/// "out of disk space?" grumbling on stderr is never consulted.
pub fn probe_pnm(
    runner: &dyn ToolRunner,
    bytes: &[u8],
    image_type: ImageType,
    file: File,
) -> Result<ImageFile> {
    let cmds = [decoder(image_type), Cmd::new("pnmfile")];
    let stdout = runner
        .run_pipeline(&cmds, bytes)
        .map_err(|e| e.in_function("probe_pnm"))?;
    let report = String::from_utf8_lossy(&stdout);

    for line in report.lines() {
        let Some(captures) = PNMFILE_LINE.captures(line.trim_end()) else {
            continue;
        };
        let width: u32 = parse_field(&captures[1], "width")?;
        let height: u32 = parse_field(&captures[2], "height")?;
        let max_val: u32 = match captures.get(4) {
            Some(m) => parse_field(m.as_str(), "maxval")?,
            None => 1,
        };
        if width == 0 || height == 0 {
            return Err(Error::caller(format!(
                "pnmfile reported degenerate dimensions {width}x{height}"
            ))
            .in_function("probe_pnm"));
        }
        return Ok(ImageFile {
            file,
            image_type,
            width,
            height,
            max_val,
        });
    }

    Err(Error::caller(format!(
        "unrecognized pnmfile output: {}",
        report.trim_end()
    ))
    .with_stdout(&stdout)
    .in_function("probe_pnm"))
}

fn parse_field(text: &str, what: &str) -> Result<u32> {
    text.parse()
        .map_err(|_| Error::caller(format!("bad {what} in pnmfile output: {text}")))
}
