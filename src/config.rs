use crate::{
    mixer::MixerConfig,
    remote::SessionSetup,
    session::CostGuard,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tokio::fs::read_to_string;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// WebSocket endpoint of the streaming audio service
    pub url: String,

    /// Sent as a bearer token when present
    pub api_key: Option<String>,
}

#[cfg(feature = "discord")]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DiscordConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Guild (server) ID for registering slash commands
    pub discord_guild_id: u64,
}

/// Per-session tunables. Snapshotted when a session starts and never
/// changed while it runs.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    pub model_id: String,
    pub voice_name: String,

    /// How much mixed audio is forwarded per step
    pub input_buffer_ms: u64,

    /// Frames quieter than this never count as speech. `-inf` disables.
    pub silence_level_db: f32,

    pub mix_headroom_db: f32,

    /// Per-speaker mixer backlog before the oldest audio is dropped
    pub max_speaker_buffer_ms: u64,

    /// Session spending ceiling in USD. `inf` disables.
    pub cost_guard_usd: f64,

    pub cost_per_byte_in: f64,
    pub cost_per_byte_out: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            model_id: "gemini-2.5-flash-preview-native-audio-dialog".to_string(),
            voice_name: "aura-asteria-en".to_string(),
            input_buffer_ms: 100,
            silence_level_db: -45.0,
            mix_headroom_db: 6.0,
            max_speaker_buffer_ms: 1000,
            cost_guard_usd: 2.0,
            // 16kHz s16le upstream is 32000 bytes/s, 24kHz downstream 48000
            // bytes/s, priced at roughly $3 and $12 per million audio tokens
            // at 25 tokens/s
            cost_per_byte_in: 2.34e-9,
            cost_per_byte_out: 6.25e-9,
        }
    }
}

impl SessionSettings {
    /// Reject values that cannot drive a session.
    pub fn validate(&self) -> Result<()> {
        if self.input_buffer_ms == 0 {
            bail!("input_buffer_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn input_buffer(&self) -> Duration {
        Duration::from_millis(self.input_buffer_ms)
    }

    pub fn silence_threshold(&self) -> Option<f32> {
        Some(self.silence_level_db).filter(|db| db.is_finite())
    }

    pub fn cost_guard(&self) -> CostGuard {
        CostGuard {
            cost_per_byte_in: self.cost_per_byte_in,
            cost_per_byte_out: self.cost_per_byte_out,
            ceiling: Some(self.cost_guard_usd).filter(|usd| usd.is_finite()),
        }
    }

    pub fn setup(&self) -> SessionSetup {
        SessionSetup::new(&self.model_id, &self.voice_name)
    }

    pub fn mixer_config(&self) -> MixerConfig {
        let defaults = MixerConfig::default();
        MixerConfig {
            headroom_db: self.mix_headroom_db,
            max_buffered_frames: (defaults.sample_rate as u64 * self.max_speaker_buffer_ms / 1000)
                as usize,
            ..defaults
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub remote: RemoteConfig,

    #[serde(default)]
    pub session: SessionSettings,

    #[cfg(feature = "discord")]
    pub discord: Option<DiscordConfig>,
}

pub async fn load() -> Result<Config> {
    load_from("Config.toml").await
}

pub async fn load_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let config = read_to_string(path)
        .await
        .with_context(|| format!("Could not read {}", path.display()))?;
    let config: Config =
        toml::from_str(&config).with_context(|| format!("Invalid config in {}", path.display()))?;
    config
        .session
        .validate()
        .with_context(|| format!("Invalid [session] in {}", path.display()))?;

    Ok(config)
}
