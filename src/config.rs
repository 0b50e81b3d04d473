//! Engine constants and persisted audio settings.

/// Sample rate every stem is resampled to at decode time. All in-memory PCM
/// and all transport positions are expressed at this rate.
pub const CANONICAL_SAMPLE_RATE: u32 = 48_000;

/// Upper bound on stems per song. Fixed so the mixer can keep per-stem state
/// and level telemetry in flat arrays that never reallocate on the hot path.
pub const MAX_STEMS: usize = 64;

/// Persisted audio/runtime preferences, stored as rows in `app_settings`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AudioSettings {
    /// Preferred output device; `None` selects the system default.
    #[serde(default)]
    pub output_device_name: Option<String>,
    #[serde(default = "default_buffer_size_frames")]
    pub buffer_size_frames: u32,
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_cache_budget_bytes")]
    pub cache_budget_bytes: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            output_device_name: None,
            buffer_size_frames: default_buffer_size_frames(),
            sample_rate_hz: default_sample_rate_hz(),
            theme: default_theme(),
            cache_budget_bytes: default_cache_budget_bytes(),
        }
    }
}

fn default_buffer_size_frames() -> u32 {
    512
}

fn default_sample_rate_hz() -> u32 {
    CANONICAL_SAMPLE_RATE
}

fn default_theme() -> String {
    "dark".to_string()
}

fn default_cache_budget_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings: AudioSettings = serde_json::from_str("{}").expect("empty object parses");
        assert_eq!(settings, AudioSettings::default());
        assert_eq!(settings.sample_rate_hz, CANONICAL_SAMPLE_RATE);
        assert_eq!(settings.buffer_size_frames, 512);
    }
}
