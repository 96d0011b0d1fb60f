//! Wires capture -> mixer -> 16kHz -> voice gate -> session, and
//! session -> 24kHz speech -> 48kHz -> playback sink.

use crate::{
    config::SessionSettings,
    error::SessionError,
    mixer::{Mixer, SpeakerId},
    pcm,
    remote::Connector,
    resample::Resampler,
    session::StreamingSession,
    vad::VoiceActivityGate,
};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinSet},
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Interleaved audio from one speaker as delivered by the voice transport.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedFrame {
    pub speaker: SpeakerId,
    pub samples: Vec<f32>,
    pub channels: u16,
}

impl CapturedFrame {
    pub fn from_s16le(speaker: SpeakerId, bytes: &[u8], channels: u16) -> Self {
        CapturedFrame {
            speaker,
            samples: pcm::s16le_to_f32(bytes),
            channels,
        }
    }

    pub fn from_i16(speaker: SpeakerId, samples: &[i16], channels: u16) -> Self {
        CapturedFrame {
            speaker,
            samples: pcm::i16_to_f32(samples),
            channels,
        }
    }
}

/// Unbounded sequence of captured frames. `None` once the transport is gone.
#[async_trait]
pub trait CaptureSource: Send {
    async fn next_frame(&mut self) -> Option<CapturedFrame>;
}

#[async_trait]
impl CaptureSource for mpsc::Receiver<CapturedFrame> {
    async fn next_frame(&mut self) -> Option<CapturedFrame> {
        self.recv().await
    }
}

/// Accepts 48kHz mono float buffers for output.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    async fn play(&self, pcm: Vec<f32>) -> Result<()>;
}

/// How a voice session ended.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionOutcome {
    Cancelled,
    CaptureEnded,
    RemoteEnded,
    CostGuardExceeded,
    ConnectFailed(String),
    ConnectionLost(String),
}

impl SessionOutcome {
    /// Message shown to the users of the voice channel.
    pub fn notice(&self) -> String {
        match self {
            SessionOutcome::Cancelled => "Left the voice channel.".to_string(),
            SessionOutcome::CaptureEnded => "Voice connection ended.".to_string(),
            SessionOutcome::RemoteEnded => {
                "The remote audio service ended the session.".to_string()
            }
            SessionOutcome::CostGuardExceeded => "Session ended: cost guard exceeded.".to_string(),
            SessionOutcome::ConnectFailed(e) => {
                format!("Could not connect to the remote audio service: {e}")
            }
            SessionOutcome::ConnectionLost(_) => {
                "Session ended: lost connection to the remote audio service.".to_string()
            }
        }
    }

    /// When several tasks end at once, the most specific reason wins.
    fn rank(&self) -> u8 {
        match self {
            SessionOutcome::CostGuardExceeded => 5,
            SessionOutcome::ConnectFailed(_) | SessionOutcome::ConnectionLost(_) => 4,
            SessionOutcome::Cancelled => 3,
            SessionOutcome::CaptureEnded => 2,
            SessionOutcome::RemoteEnded => 1,
        }
    }
}

impl From<SessionError> for SessionOutcome {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::CostGuardExceeded { .. } => SessionOutcome::CostGuardExceeded,
            SessionError::ConnectionError(e) => SessionOutcome::ConnectionLost(e),
            SessionError::Closed => SessionOutcome::RemoteEnded,
        }
    }
}

/// Run one voice session until it ends or `cancel` fires.
///
/// Transport and cost conditions end the session cleanly and are reported as
/// a `SessionOutcome`. Malformed audio and missing DSP capabilities are bugs
/// and come back as errors. Every spawned task has exited and the session is
/// closed by the time this returns.
pub async fn run<C, S>(
    settings: &SessionSettings,
    connector: Arc<dyn Connector>,
    capture: C,
    sink: Arc<S>,
    cancel: CancellationToken,
) -> Result<SessionOutcome>
where
    C: CaptureSource + 'static,
    S: PlaybackSink + ?Sized + 'static,
{
    settings.validate()?;

    let downsampler = Resampler::downsample_48k_to_16k()?;
    let upsampler = Resampler::upsample_24k_to_48k()?;
    let gate = VoiceActivityGate::new()?;
    let mixer = Mixer::new(settings.mixer_config());

    let session = StreamingSession::new(connector, settings.setup(), settings.cost_guard());
    if let Err(e) = session.create().await {
        error!("Failed to create streaming session: {e}");
        return Ok(SessionOutcome::ConnectFailed(e.to_string()));
    }

    let tasks_cancel = cancel.child_token();
    // Tasks yield `None` when they stopped because the session was torn down
    let mut tasks: JoinSet<Result<Option<SessionOutcome>>> = JoinSet::new();

    let send_loop = session.start_send_loop();
    tasks.spawn(async move {
        match send_loop.await {
            Ok(Ok(())) => Ok(None),
            Ok(Err(e)) => Ok(Some(e.into())),
            Err(e) => Ok(Some(SessionOutcome::ConnectionLost(e.to_string()))),
        }
    });

    let capture_step = CaptureStep {
        mixer,
        downsampler,
        gate,
        settings: settings.clone(),
    };
    tasks.spawn(capture_loop(
        capture,
        capture_step,
        session.clone(),
        tasks_cancel.clone(),
    ));
    tasks.spawn(playback_loop(
        session.clone(),
        upsampler,
        sink,
        tasks_cancel.clone(),
    ));

    let first = tokio::select! {
        _ = cancel.cancelled() => None,
        exit = tasks.join_next() => exit,
    };

    tasks_cancel.cancel();
    session.close().await;

    let mut outcome = if cancel.is_cancelled() {
        SessionOutcome::Cancelled
    } else {
        SessionOutcome::RemoteEnded
    };
    let mut failure = None;

    let mut record = |exit: Result<Result<Option<SessionOutcome>>, JoinError>| match exit {
        Ok(Ok(Some(ended))) => {
            if ended.rank() > outcome.rank() {
                outcome = ended;
            }
        }
        Ok(Ok(None)) => {}
        Ok(Err(e)) => {
            error!("Voice session task failed: {e:?}");
            failure.get_or_insert(e);
        }
        Err(e) => {
            error!("Voice session task panicked: {e}");
            failure.get_or_insert(anyhow::anyhow!("voice session task failed: {e}"));
        }
    };

    if let Some(exit) = first {
        record(exit);
    }
    while let Some(exit) = tasks.join_next().await {
        record(exit);
    }
    // The task that observed a self-close may have lost the race to teardown
    if let Some(reason) = session.close_reason() {
        record(Ok(Ok(Some(reason.into()))));
    }

    info!(
        "Voice session ended: {outcome:?} ({} bytes in, {} bytes out, cost {:.4})",
        session.bytes_in(),
        session.bytes_out(),
        session.cost()
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

/// Mixer and DSP chain owned by the capture task.
struct CaptureStep {
    mixer: Mixer,
    downsampler: Resampler,
    gate: VoiceActivityGate,
    settings: SessionSettings,
}

impl CaptureStep {
    /// Mix one window, downsample it and return it if any frame is speech.
    fn next_payload(&mut self) -> Result<Option<Bytes>> {
        if self.mixer.is_empty() {
            return Ok(None);
        }

        let mixed = self.mixer.pop(self.settings.input_buffer());
        let pcm16 = pcm::f32_to_s16le(&self.downsampler.process(&mixed));

        let threshold = self.settings.silence_threshold();
        let mut speech = false;
        for frame in pcm16.chunks_exact(self.gate.frame_size()) {
            if self.gate.is_speech(frame, threshold)? {
                speech = true;
                break;
            }
        }

        if !speech {
            trace!("Dropping {} bytes of non-speech audio", pcm16.len());
            return Ok(None);
        }

        Ok(Some(Bytes::from(pcm16)))
    }
}

async fn capture_loop<C: CaptureSource>(
    mut capture: C,
    mut step: CaptureStep,
    session: StreamingSession,
    cancel: CancellationToken,
) -> Result<Option<SessionOutcome>> {
    let mut ticker = interval(step.settings.input_buffer());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            // Ahead of capture so a backlog of frames cannot starve the pop
            _ = ticker.tick() => {
                let Some(payload) = step.next_payload()? else {
                    continue;
                };
                if let Err(e) = session.send_pcm(payload).await {
                    return Ok(Some(e.into()));
                }
            }
            frame = capture.next_frame() => {
                let Some(frame) = frame else {
                    info!("Capture source ended");
                    return Ok(Some(SessionOutcome::CaptureEnded));
                };
                step.mixer.add(frame.speaker, &frame.samples, frame.channels)?;
            }
        }
    }
}

async fn playback_loop<S: PlaybackSink + ?Sized>(
    session: StreamingSession,
    upsampler: Resampler,
    sink: Arc<S>,
    cancel: CancellationToken,
) -> Result<Option<SessionOutcome>> {
    let mut stream = session.iter_audio();

    let outcome = loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            chunk = stream.next() => chunk,
        };

        match chunk {
            None => break Some(SessionOutcome::RemoteEnded),
            Some(Err(e)) => break Some(e.into()),
            Some(Ok(audio)) => {
                let pcm48 = upsampler.process(&pcm::s16le_to_f32(&audio));
                if let Err(e) = sink.play(pcm48).await {
                    stream.finish().await;
                    return Err(e);
                }
            }
        }
    };

    stream.finish().await;
    Ok(outcome)
}
