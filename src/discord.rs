//! Discord integration.
//!
//! This module provides:
//! - `/partybot` slash commands to join/leave and tune the session
//! - Voice capture via songbird's `VoiceTick` events
//! - Playback of remote speech through a pull-based songbird input

use crate::{
    config::{Config, DiscordConfig, SessionSettings},
    constants::{VOICE_CHANNELS, VOICE_SAMPLE_RATE},
    pipeline::{self, CapturedFrame},
    playback::{create_buffer, BufferedSink, SharedPlaybackBuffer},
    remote::{Connector, WebSocketConnector},
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use poise::serenity_prelude::{self as serenity, ChannelId, CreateMessage, GuildId, Http};
use songbird::{
    driver::{DecodeConfig, DecodeMode},
    input::{Input, RawAdapter},
    tracks::Track,
    CoreEvent, Event as VoiceEvent, EventContext, EventHandler as VoiceEventHandler,
    SerenityInit,
};
use std::{
    collections::HashMap,
    io::{Read, Seek, SeekFrom},
    sync::Arc,
};
use symphonia::core::io::MediaSource;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};
use tokio_util::sync::CancellationToken;

/// Captured frames waiting for the mixer. At 20ms per frame and a handful
/// of speakers this is a few seconds of slack.
const CAPTURE_CHANNEL_CAPACITY: usize = 512;

/// Discord bot state shared across handlers
struct BotState {
    config: Config,
    connector: Arc<dyn Connector>,
    /// Settings changed through commands, in memory only
    guild_settings: HashMap<GuildId, SessionSettings>,
    /// Cancellation handle of the running session per guild
    active_sessions: HashMap<GuildId, CancellationToken>,
}

impl BotState {
    fn settings(&self, guild_id: GuildId) -> SessionSettings {
        self.guild_settings
            .get(&guild_id)
            .cloned()
            .unwrap_or_else(|| self.config.session.clone())
    }

    fn settings_mut(&mut self, guild_id: GuildId) -> &mut SessionSettings {
        let defaults = self.config.session.clone();
        self.guild_settings.entry(guild_id).or_insert(defaults)
    }
}

type Context<'a> = poise::Context<'a, Arc<RwLock<BotState>>, anyhow::Error>;

// ============================================================================
// Voice Audio Source
// ============================================================================

/// Pull-based audio source that reads remote speech on demand.
/// Songbird's audio thread calls Read::read() which drains the playback buffer.
struct PlaybackAudioSource {
    buffer: SharedPlaybackBuffer,
}

/// Write mono f32 samples as interleaved stereo f32 bytes
fn mono_to_stereo_f32_bytes_into(samples: &[f32], buf: &mut [u8]) -> usize {
    let mut offset = 0;
    for sample in samples {
        if offset + 8 > buf.len() {
            break;
        }
        let bytes = sample.to_le_bytes();
        buf[offset..offset + 4].copy_from_slice(&bytes);
        buf[offset + 4..offset + 8].copy_from_slice(&bytes);
        offset += 8;
    }
    offset
}

impl Read for PlaybackAudioSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // f32 stereo = 8 bytes per frame
        let frames_needed = buf.len() / 8;

        let samples = match self.buffer.lock() {
            Ok(mut buffer) => buffer.pull_samples(frames_needed),
            Err(_) => vec![0.0; frames_needed],
        };

        let bytes_written = mono_to_stereo_f32_bytes_into(&samples, buf);
        if bytes_written < buf.len() {
            buf[bytes_written..].fill(0);
        }

        Ok(buf.len())
    }
}

impl Seek for PlaybackAudioSource {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        // Live audio source doesn't support seeking
        Ok(0)
    }
}

impl MediaSource for PlaybackAudioSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

fn create_voice_input(buffer: SharedPlaybackBuffer) -> Input {
    let source = PlaybackAudioSource { buffer };
    RawAdapter::new(source, VOICE_SAMPLE_RATE, VOICE_CHANNELS as u32).into()
}

// ============================================================================
// Voice capture
// ============================================================================

/// Forwards decoded voice of every speaking user into the capture channel.
///
/// Users are keyed by SSRC, which is stable for the lifetime of a call.
pub(crate) struct VoiceReceiver {
    pub(crate) tx: mpsc::Sender<CapturedFrame>,
}

impl VoiceReceiver {
    /// Queue one frame. Returns false once the session has gone away.
    pub(crate) fn deliver(&self, frame: CapturedFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Capture channel full, dropping voice frame");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[async_trait]
impl VoiceEventHandler for VoiceReceiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        if let EventContext::VoiceTick(tick) = ctx {
            for (&ssrc, data) in tick.speaking.iter() {
                let Some(decoded) = &data.decoded_voice else {
                    continue;
                };

                let frame = CapturedFrame::from_i16(ssrc as u64, decoded, VOICE_CHANNELS);
                if !self.deliver(frame) {
                    debug!("Capture channel closed, removing voice receiver");
                    return Some(VoiceEvent::Cancel);
                }
            }
        }

        None
    }
}

/// Ends the session when the voice connection drops.
struct DisconnectHandler {
    cancel: CancellationToken,
}

#[async_trait]
impl VoiceEventHandler for DisconnectHandler {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<VoiceEvent> {
        info!("Voice driver disconnected");
        self.cancel.cancel();
        Some(VoiceEvent::Cancel)
    }
}

/// Initialize the Discord bot
pub async fn init(config: &Config, discord_config: &DiscordConfig) -> Result<()> {
    let guild_id = GuildId::new(discord_config.discord_guild_id);
    let token = discord_config.discord_token.clone();

    let connector: Arc<dyn Connector> = Arc::new(WebSocketConnector::new(
        &config.remote.url,
        config.remote.api_key.clone(),
    ));

    let state = Arc::new(RwLock::new(BotState {
        config: config.clone(),
        connector,
        guild_settings: HashMap::new(),
        active_sessions: HashMap::new(),
    }));

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![partybot()],
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                // Register commands for the specific guild (faster updates during development)
                poise::builtins::register_in_guild(ctx, &framework.options().commands, guild_id)
                    .await?;

                info!("Discord bot ready and commands registered!");
                Ok(state)
            })
        })
        .build();

    let songbird_config = songbird::Config::default()
        .decode_mode(DecodeMode::Decode(DecodeConfig::default()));

    let intents = serenity::GatewayIntents::non_privileged();

    let client = serenity::ClientBuilder::new(&token, intents)
        .framework(framework)
        .register_songbird_from_config(songbird_config)
        .await?;

    // Spawn the Discord client in a separate task
    tokio::spawn(async move {
        let mut client = client;
        if let Err(e) = client.start().await {
            error!("Discord client error: {:?}", e);
        }
    });

    Ok(())
}

/// Real-time voice chat with the remote audio service
#[poise::command(
    slash_command,
    guild_only,
    subcommands("join", "leave", "setmodel", "setsilence", "setvoice", "setcostguard")
)]
async fn partybot(_ctx: Context<'_>) -> Result<(), anyhow::Error> {
    Ok(())
}

/// Join the voice channel you are in
#[poise::command(slash_command)]
async fn join(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow!("Not in a guild"))?;

    let voice_channel = {
        let guild = ctx.guild().ok_or_else(|| anyhow!("Could not get guild"))?;
        guild
            .voice_states
            .get(&ctx.author().id)
            .and_then(|state| state.channel_id)
    };
    let Some(voice_channel) = voice_channel else {
        ctx.say("You must be in a voice channel to use this command.")
            .await?;
        return Ok(());
    };

    if ctx.data().read().await.active_sessions.contains_key(&guild_id) {
        ctx.say("I am already running in this guild.").await?;
        return Ok(());
    }

    ctx.defer().await?;

    let manager = songbird::get(ctx.serenity_context())
        .await
        .ok_or_else(|| anyhow!("Songbird voice client was not initialised"))?;

    let call = match manager.join(guild_id, voice_channel).await {
        Ok(call) => call,
        Err(e) => {
            ctx.say(format!("Failed to join voice channel: {e}")).await?;
            return Ok(());
        }
    };

    let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
    let playback = create_buffer();
    let cancel = CancellationToken::new();

    {
        let mut handler = call.lock().await;
        // The call outlives a session, drop handlers left by an earlier one
        handler.remove_all_global_events();
        handler.add_global_event(VoiceEvent::Core(CoreEvent::VoiceTick), VoiceReceiver { tx });
        handler.add_global_event(
            VoiceEvent::Core(CoreEvent::DriverDisconnect),
            DisconnectHandler {
                cancel: cancel.clone(),
            },
        );
        handler.play_only(Track::new(create_voice_input(playback.clone())));
    }

    let (settings, connector) = {
        let mut state = ctx.data().write().await;
        state.active_sessions.insert(guild_id, cancel.clone());
        (state.settings(guild_id), state.connector.clone())
    };

    let data = ctx.data().clone();
    let http = ctx.serenity_context().http.clone();
    let text_channel = ctx.channel_id();

    tokio::spawn(async move {
        let sink = Arc::new(BufferedSink::new(playback));
        let notice = match pipeline::run(&settings, connector, rx, sink, cancel.clone()).await {
            Ok(outcome) => outcome.notice(),
            Err(e) => {
                error!("Error in voice session: {e:?}");
                "An error occurred during the voice session.".to_string()
            }
        };

        if let Err(e) = manager.leave(guild_id).await {
            warn!("Failed to leave voice channel: {e}");
        }

        {
            let mut state = data.write().await;
            // A newer session may already have taken this guild's slot
            if let Some(active) = state.active_sessions.get(&guild_id) {
                if active.is_cancelled() || !cancel.is_cancelled() {
                    state.active_sessions.remove(&guild_id);
                }
            }
        }

        notify(&http, text_channel, notice).await;
    });

    ctx.say(format!("Joining <#{voice_channel}>.")).await?;
    Ok(())
}

async fn notify(http: &Arc<Http>, channel_id: ChannelId, text: String) {
    if let Err(e) = channel_id
        .send_message(http, CreateMessage::new().content(text))
        .await
    {
        warn!("Failed to post session notice: {e}");
    }
}

/// Leave the voice channel
#[poise::command(slash_command)]
async fn leave(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow!("Not in a guild"))?;

    let cancel = ctx.data().write().await.active_sessions.remove(&guild_id);
    match cancel {
        Some(cancel) => {
            cancel.cancel();
            ctx.say("Leaving the voice channel.").await?;
        }
        None => {
            ctx.say("I am not in a voice channel.").await?;
        }
    }

    Ok(())
}

/// Set the model used for new sessions
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
async fn setmodel(
    ctx: Context<'_>,
    #[description = "Model identifier"] model_id: String,
) -> Result<(), anyhow::Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow!("Not in a guild"))?;
    ctx.data().write().await.settings_mut(guild_id).model_id = model_id.clone();
    ctx.say(format!("Model set to `{model_id}`.")).await?;
    Ok(())
}

/// Set the silence detection threshold in dB
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
async fn setsilence(
    ctx: Context<'_>,
    #[description = "Level in dBFS, e.g. -45"] level_db: i32,
) -> Result<(), anyhow::Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow!("Not in a guild"))?;
    ctx.data().write().await.settings_mut(guild_id).silence_level_db = level_db as f32;
    ctx.say(format!("Silence level set to {level_db} dB.")).await?;
    Ok(())
}

/// Set the voice used for responses
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
async fn setvoice(
    ctx: Context<'_>,
    #[description = "Voice name"] voice_name: String,
) -> Result<(), anyhow::Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow!("Not in a guild"))?;
    ctx.data().write().await.settings_mut(guild_id).voice_name = voice_name.clone();
    ctx.say(format!("Voice name set to `{voice_name}`.")).await?;
    Ok(())
}

/// Set the per-session cost guard in USD
#[poise::command(slash_command, required_permissions = "MANAGE_GUILD")]
async fn setcostguard(
    ctx: Context<'_>,
    #[description = "Spending ceiling in USD"] dollars: f64,
) -> Result<(), anyhow::Error> {
    let guild_id = ctx.guild_id().ok_or_else(|| anyhow!("Not in a guild"))?;
    if dollars.is_nan() || dollars <= 0.0 {
        ctx.say("The cost guard must be a positive amount.").await?;
        return Ok(());
    }

    ctx.data().write().await.settings_mut(guild_id).cost_guard_usd = dollars;
    ctx.say(format!("Cost guard set to ${dollars:.2}.")).await?;
    Ok(())
}
