use std::fs::File;
use std::io::Read;

use derive_more::{Display, Error, From};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Display, From, Error)]
pub enum SettingsError {
    Io(std::io::Error),
    Toml(toml::de::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Time to wait for a response, in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Local port of the shared IPv4 UDP socket, 0 picks a random one
    #[serde(default)]
    pub udp_port_v4: u16,
    #[serde(default)]
    pub udp_port_v6: u16,
    /// Promote decoded records to their typed shape
    #[serde(default)]
    pub promote: bool,
    /// Repeat truncated UDP answers over TCP
    #[serde(default)]
    pub tcp_fallback: bool,
    #[serde(default = "default_recursion")]
    pub recursion_desired: bool,
}

impl Settings {
    pub fn new<S: Into<String>>(settings: S) -> Result<Settings, SettingsError> {
        Ok(toml::from_str(&settings.into())?)
    }

    pub fn load(filename: &str) -> Result<Settings, SettingsError> {
        let mut file = File::open(filename)?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        let settings = Settings::new(text)?;
        debug!("Loaded settings from {}: {:?}", filename, &settings);

        Ok(settings)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            udp_port_v4: 0,
            udp_port_v6: 0,
            promote: false,
            tcp_fallback: false,
            recursion_desired: default_recursion(),
        }
    }
}

fn default_timeout() -> u64 {
    4000
}

fn default_recursion() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_config() {
        assert_eq!(Settings::default(), Settings::new("").unwrap());
    }

    #[test]
    fn test_partial_config() {
        let settings = Settings::new("timeout = 250\npromote = true\nudp_port_v4 = 5300\n").unwrap();
        assert_eq!(250, settings.timeout);
        assert!(settings.promote);
        assert_eq!(5300, settings.udp_port_v4);
        assert!(settings.recursion_desired);
        assert!(!settings.tcp_fallback);
    }

    #[test]
    fn test_bad_config() {
        assert!(matches!(Settings::new("timeout = \"soon\""), Err(SettingsError::Toml(_))));
        assert!(matches!(Settings::load("/nonexistent/dnsreq.toml"), Err(SettingsError::Io(_))));
    }

    #[test]
    fn test_settings_roundtrip() {
        let settings = Settings {
            timeout: 1000,
            tcp_fallback: true,
            ..Settings::default()
        };
        let text = toml::to_string(&settings).unwrap();
        assert_eq!(settings, Settings::new(text).unwrap());
    }
}
