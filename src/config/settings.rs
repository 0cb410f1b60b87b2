//! Settings loading from a JSON file plus `ZYGOTE_*` environment overrides

use crate::config::types::{Result, ZygoteError, DEFAULT_MAX_MESSAGE_BYTES, MAX_DESCRIPTORS};
use crate::ipc::channel::ChannelLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "ZYGOTE_";

/// Runtime settings for the controller, zygote and helpers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZygoteSettings {
    /// Largest payload accepted on any channel, header included
    pub max_message_bytes: usize,
    /// Largest number of descriptors accepted with one message
    pub max_descriptors: usize,
    /// Environment variable naming the handshake descriptor
    pub handshake_env_var: String,
    /// Directory a confined worker uses as its new root
    pub chroot_dir: PathBuf,
    /// Consecutive readiness-wait failures after which a helper gives up
    pub helper_max_poll_failures: u32,
    /// Directories scanned for font files
    pub font_directories: Vec<PathBuf>,
    /// Family used when a lookup names nothing the catalog knows
    pub default_font_family: String,
}

impl Default for ZygoteSettings {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_descriptors: MAX_DESCRIPTORS,
            handshake_env_var: "SBX_D".to_string(),
            chroot_dir: PathBuf::from("/var/empty"),
            helper_max_poll_failures: 3,
            font_directories: vec![
                PathBuf::from("/usr/share/fonts"),
                PathBuf::from("/usr/local/share/fonts"),
            ],
            default_font_family: "sans-serif".to_string(),
        }
    }
}

impl ZygoteSettings {
    /// Load settings: JSON file (if any), then environment overrides, then validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        settings.apply_overrides(std::env::vars())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file; missing keys keep their defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ZygoteError::Config(format!(
                "Failed to read settings file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| ZygoteError::Config(format!("Failed to parse settings JSON: {}", e)))
    }

    /// Apply `ZYGOTE_*` overrides from the given variables
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match name {
                "MAX_MESSAGE_BYTES" => self.max_message_bytes = parse_number(&key, &value)?,
                "MAX_DESCRIPTORS" => self.max_descriptors = parse_number(&key, &value)?,
                "HANDSHAKE_ENV_VAR" => self.handshake_env_var = value,
                "CHROOT_DIR" => self.chroot_dir = PathBuf::from(value),
                "HELPER_MAX_POLL_FAILURES" => {
                    self.helper_max_poll_failures = parse_number(&key, &value)?
                }
                "FONT_DIRECTORIES" => {
                    self.font_directories = std::env::split_paths(&value).collect();
                }
                "DEFAULT_FONT_FAMILY" => self.default_font_family = value,
                _ => log::debug!("Ignoring unknown setting override {}", key),
            }
        }

        Ok(())
    }

    /// Reject settings no component can work with
    pub fn validate(&self) -> Result<()> {
        if self.max_message_bytes < 64 {
            return Err(ZygoteError::Config(format!(
                "max_message_bytes must be at least 64, got {}",
                self.max_message_bytes
            )));
        }

        if self.max_descriptors > MAX_DESCRIPTORS {
            return Err(ZygoteError::Config(format!(
                "max_descriptors may not exceed {}, got {}",
                MAX_DESCRIPTORS, self.max_descriptors
            )));
        }

        if self.handshake_env_var.is_empty() || self.handshake_env_var.contains('=') {
            return Err(ZygoteError::Config(format!(
                "Invalid handshake environment variable name: {:?}",
                self.handshake_env_var
            )));
        }

        if self.helper_max_poll_failures == 0 {
            return Err(ZygoteError::Config(
                "helper_max_poll_failures must be at least 1".to_string(),
            ));
        }

        if !self.chroot_dir.is_absolute() {
            return Err(ZygoteError::Config(format!(
                "chroot_dir must be absolute: {}",
                self.chroot_dir.display()
            )));
        }

        Ok(())
    }

    /// Channel limits derived from these settings
    pub fn channel_limits(&self) -> ChannelLimits {
        ChannelLimits {
            max_payload: self.max_message_bytes,
            max_descriptors: self.max_descriptors,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ZygoteError::Config(format!("{} must be a number, got {:?}", key, value)))
}
