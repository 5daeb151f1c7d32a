use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GiffyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Gif,
    Mp4,
    Webm,
    Mp3,
    Webp,
    Avi,
    Mov,
    Wav,
    Flac,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 9] = [
        TargetFormat::Gif,
        TargetFormat::Mp4,
        TargetFormat::Webm,
        TargetFormat::Mp3,
        TargetFormat::Webp,
        TargetFormat::Avi,
        TargetFormat::Mov,
        TargetFormat::Wav,
        TargetFormat::Flac,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Gif => "gif",
            TargetFormat::Mp4 => "mp4",
            TargetFormat::Webm => "webm",
            TargetFormat::Mp3 => "mp3",
            TargetFormat::Webp => "webp",
            TargetFormat::Avi => "avi",
            TargetFormat::Mov => "mov",
            TargetFormat::Wav => "wav",
            TargetFormat::Flac => "flac",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            TargetFormat::Gif => "image/gif",
            TargetFormat::Mp4 => "video/mp4",
            TargetFormat::Webm => "video/webm",
            TargetFormat::Mp3 => "audio/mpeg",
            TargetFormat::Webp => "image/webp",
            TargetFormat::Avi => "video/x-msvideo",
            TargetFormat::Mov => "video/quicktime",
            TargetFormat::Wav => "audio/wav",
            TargetFormat::Flac => "audio/flac",
        }
    }

    /// Output carries a video stream (animated images included).
    pub fn has_video(self) -> bool {
        !self.is_audio_only()
    }

    pub fn is_audio_only(self) -> bool {
        matches!(
            self,
            TargetFormat::Mp3 | TargetFormat::Wav | TargetFormat::Flac
        )
    }

    /// Animated image formats drop the audio track.
    pub fn is_animated_image(self) -> bool {
        matches!(self, TargetFormat::Gif | TargetFormat::Webp)
    }

    pub fn retains_audio(self) -> bool {
        !self.is_animated_image()
    }

    /// GIF needs a palette pass before the encode pass.
    pub fn pass_count(self) -> usize {
        if self == TargetFormat::Gif {
            2
        } else {
            1
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TargetFormat {
    type Err = GiffyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        TargetFormat::ALL
            .into_iter()
            .find(|f| f.extension() == lowered)
            .ok_or_else(|| GiffyError::validation(format!("Unknown conversion type: {s}")))
    }
}

/// Container extension used for the engine's input file, from the source MIME type.
pub fn input_extension(mime: &str) -> &'static str {
    match mime {
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "video/x-msvideo" => "avi",
        "image/gif" => "gif",
        _ => "mp4",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names_case_insensitively() {
        assert_eq!("GIF".parse::<TargetFormat>().unwrap(), TargetFormat::Gif);
        assert_eq!(" webm ".parse::<TargetFormat>().unwrap(), TargetFormat::Webm);
        assert!("mkv".parse::<TargetFormat>().is_err());
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for format in TargetFormat::ALL {
            assert_eq!(format.to_string().parse::<TargetFormat>().unwrap(), format);
        }
    }

    #[test]
    fn audio_classification() {
        assert!(TargetFormat::Mp3.is_audio_only());
        assert!(!TargetFormat::Mp3.has_video());
        assert!(TargetFormat::Mp4.retains_audio());
        assert!(!TargetFormat::Gif.retains_audio());
        assert!(!TargetFormat::Webp.retains_audio());
    }

    #[test]
    fn only_gif_is_two_pass() {
        for format in TargetFormat::ALL {
            let expected = if format == TargetFormat::Gif { 2 } else { 1 };
            assert_eq!(format.pass_count(), expected, "{format}");
        }
    }

    #[test]
    fn mime_types_match_download_artifacts() {
        assert_eq!(TargetFormat::Avi.mime(), "video/x-msvideo");
        assert_eq!(TargetFormat::Mp3.mime(), "audio/mpeg");
        assert_eq!(TargetFormat::Mov.mime(), "video/quicktime");
    }

    #[test]
    fn input_extension_follows_source_mime() {
        assert_eq!(input_extension("video/quicktime"), "mov");
        assert_eq!(input_extension("video/webm"), "webm");
        assert_eq!(input_extension("application/octet-stream"), "mp4");
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&TargetFormat::Flac).unwrap();
        assert_eq!(json, "\"flac\"");
    }
}
