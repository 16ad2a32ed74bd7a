use std::net::{IpAddr, Ipv4Addr};

use anyhow::{bail, Result};
use rocket::data::{Limits, ToByteUnit};
use rocket::figment::providers::{Env, Format, Serialized, Toml};
use rocket::figment::Figment;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 5000;

/// Service settings read from the same Figment rocket uses, so `Rocket.toml`
/// and `ROCKET_*` variables configure both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub model_id: String,
    pub revision: String,
    pub quantized: bool,
    pub quantized_model_id: String,
    pub quantized_weights: String,
    pub num_beams: usize,
    /// Includes the decoder prompt token.
    pub max_length: usize,
    pub length_penalty: f32,
    pub log_filter: String,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            model_id: "Salesforce/blip-image-captioning-large".to_string(),
            revision: "refs/pr/18".to_string(),
            quantized: false,
            quantized_model_id: "lmz/candle-blip".to_string(),
            quantized_weights: "blip-image-captioning-large-q4k.gguf".to_string(),
            num_beams: 3,
            max_length: 20,
            length_penalty: 1.0,
            log_filter: "info".to_string(),
        }
    }
}

impl CaptionConfig {
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_beams == 0 {
            bail!("num_beams must be at least 1");
        }
        if self.max_length < 2 {
            bail!("max_length must leave room for at least one generated token");
        }
        if self.model_id.trim().is_empty() {
            bail!("model_id must not be empty");
        }
        Ok(())
    }

    /// Identifier reported to clients.
    pub fn served_model(&self) -> String {
        if self.quantized {
            format!("{}/{}", self.quantized_model_id, self.quantized_weights)
        } else {
            self.model_id.clone()
        }
    }
}

/// Built-in defaults only: rocket's own, our bind address and upload limits,
/// and the caption settings.
pub fn base_figment() -> Figment {
    let limits = Limits::default()
        .limit("file", 16.mebibytes())
        .limit("data-form", 20.mebibytes());

    Figment::from(rocket::Config::default())
        .merge(Serialized::defaults(CaptionConfig::default()))
        .merge(Serialized::default("address", IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
        .merge(Serialized::default("port", DEFAULT_PORT))
        .merge(Serialized::default("limits", limits))
}

/// Defaults, then `Rocket.toml` (or `ROCKET_CONFIG`), then `ROCKET_*`.
pub fn figment() -> Figment {
    base_figment()
        .merge(Toml::file(Env::var_or("ROCKET_CONFIG", "Rocket.toml")).nested())
        .merge(Env::prefixed("ROCKET_").ignore(&["PROFILE"]).global())
}
