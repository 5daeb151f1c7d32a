use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::converter::ConversionOutput;
use crate::format::TargetFormat;

/// A finished conversion ready to be saved. The buffer stays alive until
/// `release` is called or the artifact is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadArtifact {
    bytes: Vec<u8>,
    format: TargetFormat,
    file_name: String,
}

impl DownloadArtifact {
    pub fn new(output: ConversionOutput) -> Self {
        Self::with_timestamp(output, unix_millis())
    }

    pub fn with_timestamp(output: ConversionOutput, millis: u128) -> Self {
        let file_name = format!("giffy-{millis}.{}", output.format.extension());
        Self {
            bytes: output.bytes,
            format: output.format,
            file_name,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> TargetFormat {
        self.format
    }

    pub fn mime(&self) -> &'static str {
        self.format.mime()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_released(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `KB` below one megabyte, `MB` with two decimals above.
    pub fn display_size(&self) -> String {
        let size = self.bytes.len() as f64;
        if size > 1024.0 * 1024.0 {
            format!("{:.2} MB", size / (1024.0 * 1024.0))
        } else {
            format!("{:.0} KB", size / 1024.0)
        }
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime(), BASE64.encode(&self.bytes))
    }

    /// Hand the buffer to the caller, leaving the artifact released.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    /// Free the output buffer once it has been saved or abandoned.
    pub fn release(&mut self) {
        self.bytes = Vec::new();
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
