use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// Quantizer applied to every frame when the session runs in quantizer mode.
pub const DEFAULT_QUANTIZER: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitrateMode {
    #[default]
    Constant,
    Quantizer,
}

/// Per-frame control path picked by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    // bits per second
    Bitrate(u64),
    Quantizer(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodecConfig {
    // "avc1.640034", "h264", "vp9", or an FFmpeg encoder name
    pub codec: String,
    // bps
    pub bitrate: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub bitrate_mode: BitrateMode,
    pub keyframe_interval: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            codec: "avc1.640034".to_string(),
            bitrate: 10_000_000,
            width: 1920,
            height: 1080,
            frame_rate: 60.0,
            bitrate_mode: BitrateMode::Constant,
            keyframe_interval: 60,
        }
    }
}

impl CodecConfig {
    pub fn validate(&self) -> Result<()> {
        if self.codec.trim().is_empty() {
            return Err(ExportError::Config("codec must not be empty".to_string()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ExportError::Config(format!(
                "invalid video size {}x{}",
                self.width, self.height
            )));
        }
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            return Err(ExportError::Config(format!(
                "invalid frame rate {}",
                self.frame_rate
            )));
        }
        if self.bitrate == 0 {
            return Err(ExportError::Config("bitrate must be positive".to_string()));
        }
        if self.keyframe_interval == 0 {
            return Err(ExportError::Config(
                "keyframe interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Estimated duration of one frame in microseconds.
    pub fn frame_duration_us(&self) -> i64 {
        (1_000_000.0 / self.frame_rate).round() as i64
    }

    pub fn rate_control(&self, quality_hint: Option<u8>) -> RateControl {
        match self.bitrate_mode {
            BitrateMode::Constant => RateControl::Bitrate(self.bitrate),
            BitrateMode::Quantizer => {
                RateControl::Quantizer(quality_hint.unwrap_or(DEFAULT_QUANTIZER))
            }
        }
    }
}

/// Wire form of the `configure` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureRequest {
    // kbps
    pub bitrate: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    #[serde(default)]
    pub bitrate_mode: BitrateMode,
    #[serde(default)]
    pub want_chunk_stream: bool,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub keyframe_interval: Option<u32>,
}

impl ConfigureRequest {
    pub fn new(bitrate_kbps: u64, width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            bitrate: bitrate_kbps,
            width,
            height,
            frame_rate,
            bitrate_mode: BitrateMode::Constant,
            want_chunk_stream: false,
            codec: None,
            keyframe_interval: None,
        }
    }

    pub fn with_mode(mut self, mode: BitrateMode) -> Self {
        self.bitrate_mode = mode;
        self
    }

    pub fn with_chunk_stream(mut self, enabled: bool) -> Self {
        self.want_chunk_stream = enabled;
        self
    }

    pub fn with_codec(mut self, codec: &str) -> Self {
        self.codec = Some(codec.to_string());
        self
    }

    pub fn to_codec_config(&self) -> CodecConfig {
        let defaults = CodecConfig::default();
        CodecConfig {
            codec: self.codec.clone().unwrap_or(defaults.codec),
            bitrate: self.bitrate.saturating_mul(1000),
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            bitrate_mode: self.bitrate_mode,
            keyframe_interval: self
                .keyframe_interval
                .unwrap_or(defaults.keyframe_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_converts_kbps() {
        let config = ConfigureRequest::new(500, 320, 240, 30.0).to_codec_config();
        assert_eq!(config.bitrate, 500_000);
        assert_eq!(config.codec, "avc1.640034");
        assert_eq!(config.bitrate_mode, BitrateMode::Constant);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_request_from_json() {
        let json = r#"{
            "bitrate": 10000,
            "width": 1280,
            "height": 720,
            "frameRate": 60,
            "bitrateMode": "quantizer",
            "wantChunkStream": true
        }"#;
        let request: ConfigureRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.bitrate_mode, BitrateMode::Quantizer);
        assert!(request.want_chunk_stream);
        assert_eq!(request.to_codec_config().bitrate, 10_000_000);
    }

    #[test]
    fn test_mode_defaults_to_constant() {
        let json = r#"{"bitrate": 1, "width": 2, "height": 2, "frameRate": 25}"#;
        let request: ConfigureRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.bitrate_mode, BitrateMode::Constant);
        assert!(!request.want_chunk_stream);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            CodecConfig { width: 0, ..Default::default() },
            CodecConfig { height: 0, ..Default::default() },
            CodecConfig { frame_rate: 0.0, ..Default::default() },
            CodecConfig { frame_rate: f64::NAN, ..Default::default() },
            CodecConfig { bitrate: 0, ..Default::default() },
            CodecConfig { codec: " ".to_string(), ..Default::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(ExportError::Config(_))));
        }
    }

    #[test]
    fn test_rate_control_path() {
        let constant = CodecConfig::default();
        assert_eq!(
            constant.rate_control(Some(30)),
            RateControl::Bitrate(10_000_000)
        );

        let quantizer = CodecConfig {
            bitrate_mode: BitrateMode::Quantizer,
            ..Default::default()
        };
        assert_eq!(
            quantizer.rate_control(None),
            RateControl::Quantizer(DEFAULT_QUANTIZER)
        );
        assert_eq!(quantizer.rate_control(Some(28)), RateControl::Quantizer(28));
    }

    #[test]
    fn test_frame_duration() {
        let config = CodecConfig {
            frame_rate: 30.0,
            ..Default::default()
        };
        assert_eq!(config.frame_duration_us(), 33_333);
    }
}
