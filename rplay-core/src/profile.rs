//! Video profile negotiation types.

use serde::{Deserialize, Serialize};

/// Video codec negotiated with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    H264,
    H265,
}

/// Resolution presets the host understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResolutionPreset {
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "540p")]
    P540,
    #[serde(rename = "720p")]
    P720,
    #[default]
    #[serde(rename = "1080p")]
    P1080,
}

impl ResolutionPreset {
    /// `(width, height, bitrate_kbps)` for this preset.
    pub const fn parameters(self) -> (u32, u32, u32) {
        match self {
            ResolutionPreset::P360 => (640, 360, 2_000),
            ResolutionPreset::P540 => (960, 540, 6_000),
            ResolutionPreset::P720 => (1280, 720, 10_000),
            ResolutionPreset::P1080 => (1920, 1080, 15_000),
        }
    }
}

/// Frame-rate presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FpsPreset {
    #[serde(rename = "30")]
    Fps30,
    #[default]
    #[serde(rename = "60")]
    Fps60,
}

impl FpsPreset {
    pub const fn fps(self) -> u32 {
        match self {
            FpsPreset::Fps30 => 30,
            FpsPreset::Fps60 => 60,
        }
    }
}

/// Console generation of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Ps4Unknown,
    Ps4_8,
    Ps4_9,
    Ps4_10,
    Ps5Unknown,
    #[default]
    Ps5_1,
}

impl Target {
    pub fn is_ps5(self) -> bool {
        matches!(self, Target::Ps5Unknown | Target::Ps5_1)
    }
}

/// Stream parameters requested by the client and confirmed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub max_fps: u32,
    /// Target bitrate in kbit/s.
    pub bitrate: u32,
    pub codec: Codec,
}

impl VideoProfile {
    /// Build a profile from presets.
    pub fn preset(resolution: ResolutionPreset, fps: FpsPreset, codec: Codec) -> Self {
        let (width, height, bitrate) = resolution.parameters();
        Self {
            width,
            height,
            max_fps: fps.fps(),
            bitrate,
            codec,
        }
    }
}

impl Default for VideoProfile {
    fn default() -> Self {
        Self::preset(ResolutionPreset::P1080, FpsPreset::Fps60, Codec::H264)
    }
}

impl std::fmt::Display for VideoProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}@{} {:?} {}kbps",
            self.width, self.height, self.max_fps, self.codec, self.bitrate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_1080p60_h264() {
        let p = VideoProfile::default();
        assert_eq!((p.width, p.height, p.max_fps), (1920, 1080, 60));
        assert_eq!(p.bitrate, 15_000);
        assert_eq!(p.codec, Codec::H264);
    }

    #[test]
    fn preset_720p30() {
        let p = VideoProfile::preset(ResolutionPreset::P720, FpsPreset::Fps30, Codec::H265);
        assert_eq!((p.width, p.height, p.max_fps), (1280, 720, 30));
        assert_eq!(p.to_string(), "1280x720@30 H265 10000kbps");
    }
}
