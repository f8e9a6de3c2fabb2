//! Format-conversion planning.
//!
//! The Netpbm tools converse in PPM, so every conversion routes through it:
//! a named format decodes to PPM (`jpegtopnm`, `giftopnm`, `pngtopnm`) and
//! PPM encodes to a named format (`cjpeg`, `ppmtogif`, `pnmtopng`). A
//! conversion between two named formats is the two-step path through PPM;
//! a conversion from a format to itself is no commands at all.
//!
//! [`plan`] assembles a full pipeline from typed [`Stage`]s, splicing in
//! whatever conversions are needed between consecutive stages and a final
//! conversion to the requested target type. Planning is pure — tests assert
//! on the commands it would run without spawning anything.

use crate::pipeline::Cmd;
use crate::types::ImageType;

/// Command that decodes `ty` to PPM on stdout, for pipelines that always
/// want a decoder stage (`cat` when the input is already PPM).
pub fn decoder(ty: ImageType) -> Cmd {
    match ty {
        ImageType::Ppm => Cmd::new("cat"),
        ImageType::Jpeg => Cmd::new("jpegtopnm"),
        ImageType::Gif => Cmd::new("giftopnm"),
        ImageType::Png => Cmd::new("pngtopnm"),
    }
}

fn to_ppm(ty: ImageType) -> Option<Cmd> {
    match ty {
        ImageType::Ppm => None,
        other => Some(decoder(other)),
    }
}

fn from_ppm(ty: ImageType) -> Option<Cmd> {
    match ty {
        ImageType::Ppm => None,
        ImageType::Jpeg => Some(Cmd::new("cjpeg")),
        ImageType::Gif => Some(Cmd::new("ppmtogif")),
        ImageType::Png => Some(Cmd::new("pnmtopng")),
    }
}

/// Commands converting `from` into `to`; empty when they already match.
pub fn conversion(from: ImageType, to: ImageType) -> Vec<Cmd> {
    if from == to {
        return Vec::new();
    }
    to_ppm(from).into_iter().chain(from_ppm(to)).collect()
}

/// One transformation step with declared input and output types.
#[derive(Debug, Clone)]
pub struct Stage {
    pub cmd: Cmd,
    pub input: ImageType,
    pub output: ImageType,
}

impl Stage {
    pub fn new(cmd: Cmd, input: ImageType, output: ImageType) -> Self {
        Stage { cmd, input, output }
    }
}

/// Assemble a pipeline running every stage in order, starting from an
/// image of type `start` and ending as type `target`.
///
/// A stage whose input type matches the current type is passed through
/// unchanged; otherwise the conversion to its input type is prepended.
/// After the last stage the conversion to `target` is appended.
pub fn plan(start: ImageType, stages: &[Stage], target: ImageType) -> Vec<Cmd> {
    let mut cmds = Vec::new();
    let mut current = start;
    for stage in stages {
        cmds.extend(conversion(current, stage.input));
        cmds.push(stage.cmd.clone());
        current = stage.output;
    }
    cmds.extend(conversion(current, target));
    cmds
}
