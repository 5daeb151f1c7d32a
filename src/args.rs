//! Engine argument construction. Everything here is a pure function of the
//! request, so identical requests always produce identical plans.

use crate::format::{input_extension, TargetFormat};
use crate::request::{CompressionPreset, ConversionRequest};

pub const PALETTE_FILE: &str = "palette.png";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// GIF pass 1: one global palette for the whole clip.
    Palette,
    Encode,
}

impl PassKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PassKind::Palette => "palette",
            PassKind::Encode => "encode",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnginePass {
    pub kind: PassKind,
    pub argv: Vec<String>,
    pub output: String,
}

/// Every engine invocation and virtual file a job needs, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPlan {
    pub format: TargetFormat,
    pub input: String,
    pub output: String,
    pub passes: Vec<EnginePass>,
    /// Intermediate files produced by earlier passes.
    pub scratch: Vec<String>,
}

impl JobPlan {
    /// All virtual files the job may create.
    pub fn files(&self) -> Vec<&str> {
        let mut files = vec![self.input.as_str()];
        files.extend(self.scratch.iter().map(String::as_str));
        files.push(self.output.as_str());
        files
    }
}

pub fn build_plan(req: &ConversionRequest) -> JobPlan {
    let format = req.format;
    let input = format!("input.{}", input_extension(&req.source_mime));
    let output = format!("output.{}", format.extension());

    let passes = match format {
        TargetFormat::Gif => gif_passes(req, &input, &output),
        _ => vec![EnginePass {
            kind: PassKind::Encode,
            argv: single_pass_argv(req, &input, &output),
            output: output.clone(),
        }],
    };
    let scratch = if format == TargetFormat::Gif {
        vec![PALETTE_FILE.to_string()]
    } else {
        Vec::new()
    };

    JobPlan {
        format,
        input,
        output,
        passes,
        scratch,
    }
}

/// `-ss <start> -t <duration> -i <input>`; both seek options apply to the input.
pub fn seek_args(req: &ConversionRequest, input: &str) -> Vec<String> {
    vec![
        "-ss".to_string(),
        format!("{:.3}", req.trim_start),
        "-t".to_string(),
        format!("{:.3}", req.clip_duration()),
        "-i".to_string(),
        input.to_string(),
    ]
}

/// Video filter chain in fixed order: crop, time-scale, frame rate, scale.
pub fn video_filters(req: &ConversionRequest) -> Vec<String> {
    let format = req.format;
    if format.is_audio_only() {
        return Vec::new();
    }

    let mut filters = Vec::new();

    if let Some(crop) = req.effective_crop() {
        filters.push(format!(
            "crop=iw*{}:ih*{}:iw*{}:ih*{}",
            fmt_factor(crop.w),
            fmt_factor(crop.h),
            fmt_factor(crop.x),
            fmt_factor(crop.y)
        ));
    }

    if !is_unit_speed(req.speed) {
        filters.push(format!("setpts={}*PTS", fmt_factor(1.0 / req.speed)));
    }

    let preset = CompressionPreset::for_duration(req.output_duration());
    let fps = match (req.fps, format.is_animated_image()) {
        (Some(fps), _) => Some(fps),
        (None, true) => Some(preset.fps),
        (None, false) => None,
    };
    if let Some(fps) = fps {
        filters.push(format!("fps={fps}"));
    }

    // Animated images have no chroma subsampling constraint; the video codecs
    // here all want even dimensions.
    match (req.width, format.is_animated_image()) {
        (Some(width), true) => filters.push(format!("scale={width}:-1:flags=lanczos")),
        (Some(width), false) => filters.push(format!(
            "scale={}:-2:flags=lanczos",
            (width & !1).max(2)
        )),
        (None, true) => filters.push(format!(
            "scale='min({},iw)':-1:flags=lanczos",
            preset.max_width
        )),
        (None, false) => filters.push("scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string()),
    }

    filters
}

/// Audio tempo chain matching the video time-scale. `atempo` only accepts
/// factors in `[0.5, 2.0]`, so larger changes are split into stages.
pub fn audio_filters(req: &ConversionRequest) -> Vec<String> {
    if !req.format.retains_audio() || is_unit_speed(req.speed) {
        return Vec::new();
    }

    let mut filters = Vec::new();
    let mut remaining = req.speed;
    while remaining > 2.0 {
        filters.push("atempo=2".to_string());
        remaining /= 2.0;
    }
    while remaining < 0.5 {
        filters.push("atempo=0.5".to_string());
        remaining /= 0.5;
    }
    if !is_unit_speed(remaining) {
        filters.push(format!("atempo={}", fmt_factor(remaining)));
    }
    filters
}

fn gif_passes(req: &ConversionRequest, input: &str, output: &str) -> Vec<EnginePass> {
    let chain = video_filters(req).join(",");

    let mut palette = seek_args(req, input);
    let palette_filter = if chain.is_empty() {
        "palettegen".to_string()
    } else {
        format!("{chain},palettegen")
    };
    palette.extend(["-vf".to_string(), palette_filter]);
    palette.extend(["-y".to_string(), PALETTE_FILE.to_string()]);

    let mut encode = seek_args(req, input);
    encode.extend(["-i".to_string(), PALETTE_FILE.to_string()]);
    let encode_filter = if chain.is_empty() {
        "[0:v][1:v]paletteuse".to_string()
    } else {
        format!("{chain}[x];[x][1:v]paletteuse")
    };
    encode.extend(["-filter_complex".to_string(), encode_filter]);
    encode.extend(
        ["-loop", "0", "-an", "-y"]
            .into_iter()
            .map(String::from),
    );
    encode.push(output.to_string());

    vec![
        EnginePass {
            kind: PassKind::Palette,
            argv: palette,
            output: PALETTE_FILE.to_string(),
        },
        EnginePass {
            kind: PassKind::Encode,
            argv: encode,
            output: output.to_string(),
        },
    ]
}

fn single_pass_argv(req: &ConversionRequest, input: &str, output: &str) -> Vec<String> {
    let mut args = seek_args(req, input);

    let vf = video_filters(req);
    if vf.is_empty() {
        args.push("-vn".to_string());
    } else {
        args.extend(["-vf".to_string(), vf.join(",")]);
    }

    let af = audio_filters(req);
    if !af.is_empty() {
        args.extend(["-af".to_string(), af.join(",")]);
    }

    args.extend(codec_args(req.format).iter().map(|s| s.to_string()));
    args.extend(["-y".to_string(), output.to_string()]);
    args
}

fn codec_args(format: TargetFormat) -> &'static [&'static str] {
    match format {
        TargetFormat::Mp4 | TargetFormat::Mov => &[
            "-c:v", "libx264",
            "-preset", "veryfast",
            "-crf", "23",
            "-pix_fmt", "yuv420p",
            "-c:a", "aac",
            "-b:a", "128k",
            "-movflags", "+faststart",
        ],
        TargetFormat::Webm => &[
            "-c:v", "libvpx-vp9",
            "-crf", "32",
            "-b:v", "0",
            "-deadline", "realtime",
            "-cpu-used", "8",
            "-c:a", "libopus",
            "-b:a", "96k",
        ],
        TargetFormat::Avi => &[
            "-c:v", "mpeg4",
            "-q:v", "5",
            "-c:a", "libmp3lame",
            "-b:a", "192k",
        ],
        TargetFormat::Webp => &[
            "-c:v", "libwebp",
            "-lossless", "0",
            "-compression_level", "4",
            "-quality", "75",
            "-loop", "0",
            "-an",
        ],
        TargetFormat::Mp3 => &["-c:a", "libmp3lame", "-b:a", "192k"],
        TargetFormat::Wav => &["-c:a", "pcm_s16le"],
        TargetFormat::Flac => &["-c:a", "flac"],
        // Encoded through the palette passes.
        TargetFormat::Gif => &[],
    }
}

fn is_unit_speed(speed: f64) -> bool {
    (speed - 1.0).abs() < 1e-9
}

/// Up to four decimals with trailing zeros removed: `0.5`, `1.25`, `2`.
fn fmt_factor(value: f64) -> String {
    let s = format!("{value:.4}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() || s == "-" {
        "0".to_string()
    } else {
        s.to_string()
    }
}
