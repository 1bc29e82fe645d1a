//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Audio encoders understood by the transcode command, with their `-q:a`
/// values ordered from lowest to highest quality.
///
/// flac has no quality setting; its entries are placeholders.
pub const AUDIO_ENCODER_QUALITY: &[(&str, [f64; 5])] = &[
    ("mp3", [9.9, 8.0, 5.0, 3.0, 0.0]),
    ("aac", [0.1, 0.5, 1.0, 1.5, 2.0]),
    ("libvorbis", [0.0, 2.5, 5.0, 7.5, 10.0]),
    ("flac", [0.0, 0.0, 0.0, 0.0, 0.0]),
];

/// Number of quality steps available for every encoder
pub const N_QUALITIES: u32 = 5;

/// Default duration probe command
pub const DEFAULT_PROBE_COMMAND: &str = "ffprobe -v error -show_entries format=duration \
     -of default=noprint_wrappers=1:nokey=1 \"{input}\"";

/// Default transcode command
pub const DEFAULT_TRANSCODE_COMMAND: &str = "ffmpeg -hide_banner -y -i \"{input}\" -map 0 -c:v copy \
     {remove_subtitles} -c:s copy -c:a {audio_encoder} -q:a {audio_quality} \
     -filter:a volume={volume} \"{output}\"";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value is outside its allowed range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Job concurrency configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Run one job per logical CPU
    #[serde(default = "default_true")]
    pub use_all_cpus: bool,
    /// Maximum concurrent jobs when `use_all_cpus` is false (0 = auto-derive)
    #[serde(default)]
    pub max_jobs: u32,
}

fn default_true() -> bool {
    true
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            use_all_cpus: true,
            max_jobs: 0,
        }
    }
}

/// Audio processing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// Volume multiplier passed to the audio filter
    #[serde(default = "default_volume_increase")]
    pub volume_increase: f64,
    /// Audio encoder name (key of `AUDIO_ENCODER_QUALITY`)
    #[serde(default = "default_audio_encoder")]
    pub audio_encoder: String,
    /// Quality index into the encoder's quality list
    #[serde(default = "default_audio_quality")]
    pub audio_quality: u32,
    /// Drop subtitle streams from the output
    #[serde(default)]
    pub remove_subtitles: bool,
}

fn default_volume_increase() -> f64 {
    3.0
}

fn default_audio_encoder() -> String {
    "mp3".to_string()
}

fn default_audio_quality() -> u32 {
    3
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            volume_increase: default_volume_increase(),
            audio_encoder: default_audio_encoder(),
            audio_quality: default_audio_quality(),
            remove_subtitles: false,
        }
    }
}

impl AudioConfig {
    /// Resolve the configured quality index to the encoder's `-q:a` value
    pub fn encoder_quality(&self) -> Option<f64> {
        audio_encoder_quality(&self.audio_encoder, self.audio_quality)
    }
}

/// Look up the `-q:a` value for an encoder and quality index
pub fn audio_encoder_quality(encoder: &str, index: u32) -> Option<f64> {
    AUDIO_ENCODER_QUALITY
        .iter()
        .find(|(name, _)| *name == encoder)
        .and_then(|(_, values)| values.get(index as usize).copied())
}

/// Output naming configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Keep the original file and write the result next to it
    #[serde(default)]
    pub keep_original: bool,
    /// Prefix of the output name (only used with `keep_original`)
    #[serde(default)]
    pub output_prefix: String,
    /// Suffix of the output name, before the extension (only used with `keep_original`)
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,
    /// Prefix of the in-progress temporary output file
    #[serde(default = "default_temp_file_prefix")]
    pub temp_file_prefix: String,
    /// Skip temporary output files when scanning directories
    #[serde(default = "default_true")]
    pub ignore_temp_files: bool,
}

fn default_output_suffix() -> String {
    "_Vol-inc".to_string()
}

fn default_temp_file_prefix() -> String {
    "ffmpeg_temp_".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            keep_original: false,
            output_prefix: String::new(),
            output_suffix: default_output_suffix(),
            temp_file_prefix: default_temp_file_prefix(),
            ignore_temp_files: true,
        }
    }
}

/// Directory scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Extensions (without dot, case-insensitive) treated as video files
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
}

fn default_video_extensions() -> Vec<String> {
    vec!["mp4".to_string(), "avi".to_string(), "mkv".to_string()]
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            video_extensions: default_video_extensions(),
        }
    }
}

/// Display configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DisplayConfig {
    /// Show milliseconds in elapsed/remaining times
    #[serde(default)]
    pub show_milliseconds: bool,
}

/// External command templates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandsConfig {
    /// Duration probe command, `{input}` is the video path
    #[serde(default = "default_probe_command")]
    pub probe: String,
    /// Transcode command
    #[serde(default = "default_transcode_command")]
    pub transcode: String,
}

fn default_probe_command() -> String {
    DEFAULT_PROBE_COMMAND.to_string()
}

fn default_transcode_command() -> String {
    DEFAULT_TRANSCODE_COMMAND.to_string()
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            probe: default_probe_command(),
            transcode: default_transcode_command(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - INCREASEVOL_MAX_JOBS -> jobs.max_jobs (and disables jobs.use_all_cpus)
    /// - INCREASEVOL_VOLUME -> audio.volume_increase
    /// - INCREASEVOL_AUDIO_ENCODER -> audio.audio_encoder
    /// - INCREASEVOL_AUDIO_QUALITY -> audio.audio_quality
    /// - INCREASEVOL_KEEP_ORIGINAL -> output.keep_original
    /// - INCREASEVOL_REMOVE_SUBTITLES -> audio.remove_subtitles
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("INCREASEVOL_MAX_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.jobs.max_jobs = jobs;
                self.jobs.use_all_cpus = false;
            }
        }

        if let Ok(val) = env::var("INCREASEVOL_VOLUME") {
            if let Ok(volume) = val.parse::<f64>() {
                self.audio.volume_increase = volume;
            }
        }

        if let Ok(val) = env::var("INCREASEVOL_AUDIO_ENCODER") {
            if !val.is_empty() {
                self.audio.audio_encoder = val;
            }
        }

        if let Ok(val) = env::var("INCREASEVOL_AUDIO_QUALITY") {
            if let Ok(quality) = val.parse::<u32>() {
                self.audio.audio_quality = quality;
            }
        }

        if let Ok(val) = env::var("INCREASEVOL_KEEP_ORIGINAL") {
            if let Some(flag) = parse_bool(&val) {
                self.output.keep_original = flag;
            }
        }

        if let Ok(val) = env::var("INCREASEVOL_REMOVE_SUBTITLES") {
            if let Some(flag) = parse_bool(&val) {
                self.audio.remove_subtitles = flag;
            }
        }
    }

    /// Check values that the TOML schema alone cannot constrain
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.audio.volume_increase > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "volume_increase must be greater than 0, got {}",
                self.audio.volume_increase
            )));
        }

        if !AUDIO_ENCODER_QUALITY
            .iter()
            .any(|(name, _)| *name == self.audio.audio_encoder)
        {
            let known: Vec<&str> = AUDIO_ENCODER_QUALITY.iter().map(|(name, _)| *name).collect();
            return Err(ConfigError::Invalid(format!(
                "unknown audio_encoder '{}', expected one of: {}",
                self.audio.audio_encoder,
                known.join(", ")
            )));
        }

        if self.audio.audio_quality >= N_QUALITIES {
            return Err(ConfigError::Invalid(format!(
                "audio_quality must be between 0 and {}, got {}",
                N_QUALITIES - 1,
                self.audio.audio_quality
            )));
        }

        if self.output.keep_original
            && self.output.output_prefix.is_empty()
            && self.output.output_suffix.is_empty()
        {
            return Err(ConfigError::Invalid(
                "keep_original needs a non-empty output_prefix or output_suffix".to_string(),
            ));
        }

        if self.output.temp_file_prefix.contains(std::path::is_separator) {
            return Err(ConfigError::Invalid(format!(
                "temp_file_prefix must not contain a path separator: '{}'",
                self.output.temp_file_prefix
            )));
        }

        Ok(())
    }

    /// Load configuration if the file exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("INCREASEVOL_MAX_JOBS");
        env::remove_var("INCREASEVOL_VOLUME");
        env::remove_var("INCREASEVOL_AUDIO_ENCODER");
        env::remove_var("INCREASEVOL_AUDIO_QUALITY");
        env::remove_var("INCREASEVOL_KEEP_ORIGINAL");
        env::remove_var("INCREASEVOL_REMOVE_SUBTITLES");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            use_all_cpus in proptest::bool::ANY,
            max_jobs in 0u32..64,
            volume in 0.1f64..20.0,
            encoder_idx in 0usize..4,
            quality in 0u32..5,
            keep_original in proptest::bool::ANY,
            suffix in "[a-zA-Z0-9_-]{0,10}",
        ) {
            let encoder = AUDIO_ENCODER_QUALITY[encoder_idx].0;
            let toml_str = format!(
                r#"
[jobs]
use_all_cpus = {}
max_jobs = {}

[audio]
volume_increase = {:?}
audio_encoder = "{}"
audio_quality = {}

[output]
keep_original = {}
output_suffix = "{}"
"#,
                use_all_cpus, max_jobs, volume, encoder, quality, keep_original, suffix
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.jobs.use_all_cpus, use_all_cpus);
            prop_assert_eq!(config.jobs.max_jobs, max_jobs);
            prop_assert!((config.audio.volume_increase - volume).abs() < 1e-9);
            prop_assert_eq!(config.audio.audio_encoder.as_str(), encoder);
            prop_assert_eq!(config.audio.audio_quality, quality);
            prop_assert_eq!(config.output.keep_original, keep_original);
            prop_assert_eq!(config.output.output_suffix, suffix);
        }

        #[test]
        fn prop_env_overrides_max_jobs(
            initial_jobs in 0u32..8,
            override_jobs in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[jobs]
use_all_cpus = true
max_jobs = {}
"#,
                initial_jobs
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("INCREASEVOL_MAX_JOBS", override_jobs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.jobs.max_jobs, override_jobs);
            prop_assert!(!config.jobs.use_all_cpus);
        }

        #[test]
        fn prop_env_overrides_volume(
            initial in 0.5f64..5.0,
            override_volume in 0.1f64..20.0,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[audio]\nvolume_increase = {:?}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("INCREASEVOL_VOLUME", override_volume.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert!((config.audio.volume_increase - override_volume).abs() < 1e-9);
        }

        #[test]
        fn prop_env_overrides_keep_original(
            initial in proptest::bool::ANY,
            override_keep in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[output]\nkeep_original = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("INCREASEVOL_KEEP_ORIGINAL", override_keep.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.output.keep_original, override_keep);
        }

        #[test]
        fn prop_quality_lookup_in_range(
            encoder_idx in 0usize..4,
            quality in 0u32..5,
        ) {
            let (encoder, values) = AUDIO_ENCODER_QUALITY[encoder_idx];
            prop_assert_eq!(
                audio_encoder_quality(encoder, quality),
                Some(values[quality as usize])
            );
            prop_assert_eq!(audio_encoder_quality(encoder, quality + N_QUALITIES), None);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert!(config.jobs.use_all_cpus);
        assert_eq!(config.jobs.max_jobs, 0);
        assert!((config.audio.volume_increase - 3.0).abs() < 1e-9);
        assert_eq!(config.audio.audio_encoder, "mp3");
        assert_eq!(config.audio.audio_quality, 3);
        assert!(!config.audio.remove_subtitles);
        assert!(!config.output.keep_original);
        assert_eq!(config.output.output_prefix, "");
        assert_eq!(config.output.output_suffix, "_Vol-inc");
        assert_eq!(config.output.temp_file_prefix, "ffmpeg_temp_");
        assert!(config.output.ignore_temp_files);
        assert_eq!(config.scan.video_extensions, vec!["mp4", "avi", "mkv"]);
        assert!(!config.display.show_milliseconds);
        assert_eq!(config.commands.probe, DEFAULT_PROBE_COMMAND);
        assert_eq!(config.commands.transcode, DEFAULT_TRANSCODE_COMMAND);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[audio]
audio_encoder = "aac"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.audio.audio_encoder, "aac");
        assert_eq!(config.audio.audio_quality, 3); // default
        assert_eq!(config.audio.encoder_quality(), Some(1.5));
        assert!(config.jobs.use_all_cpus); // default
    }

    #[test]
    fn test_default_mp3_quality() {
        assert_eq!(AudioConfig::default().encoder_quality(), Some(3.0));
    }

    #[test]
    fn test_validate_rejects_unknown_encoder() {
        let mut config = Config::default();
        config.audio.audio_encoder = "opus".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_quality_out_of_range() {
        let mut config = Config::default();
        config.audio.audio_quality = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_non_positive_volume() {
        let mut config = Config::default();
        config.audio.volume_increase = 0.0;
        assert!(config.validate().is_err());
        config.audio.volume_increase = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_keep_original_without_affixes() {
        let mut config = Config::default();
        config.output.keep_original = true;
        config.output.output_suffix.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = Config::parse_toml("[jobs\nmax_jobs = 2");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();
        let config = Config::load_or_default("/nonexistent/increasevol/config.toml")
            .expect("missing file falls back to defaults");
        assert_eq!(config, Config::default());
    }
}
