//! Test infrastructure for partybot-rs integration tests.
//!
//! Provides an in-memory remote service, capture feeds and playback sinks
//! so sessions and pipelines can run without network or voice transport.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// Re-export key types from the main crate
pub use partybot_rs::config::SessionSettings;
pub use partybot_rs::error::SessionError;
pub use partybot_rs::pipeline::{CapturedFrame, PlaybackSink, SessionOutcome};
pub use partybot_rs::remote::{Connector, RemoteConnection, RemoteMessage, SessionSetup};
pub use partybot_rs::session::{CostGuard, SessionState, StreamingSession};

pub type Inbound = Result<RemoteMessage, SessionError>;

/// Default timeout for async test operations.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Remote connection backed by a channel the test feeds.
pub struct FakeConnection {
    pub sent: Mutex<Vec<Bytes>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl FakeConnection {
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make every following `send` fail as if the socket had dropped.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    async fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SessionError::ConnectionError("broken pipe".to_string()));
        }
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    async fn next_message(&self) -> Option<Inbound> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out one shared `FakeConnection`.
pub struct FakeConnector {
    pub connection: Arc<FakeConnection>,
    pub setups: Mutex<Vec<SessionSetup>>,
    refuse: bool,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        setup: &SessionSetup,
    ) -> Result<Arc<dyn RemoteConnection>, SessionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(SessionError::ConnectionError(
                "connection refused".to_string(),
            ));
        }
        self.setups.lock().unwrap().push(setup.clone());
        Ok(self.connection.clone() as Arc<dyn RemoteConnection>)
    }
}

/// In-memory remote service. Push inbound messages with `remote`, drop it
/// to end the remote stream.
pub struct FakeRemote {
    pub connector: Arc<FakeConnector>,
    pub remote: mpsc::UnboundedSender<Inbound>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A remote service that refuses every connection.
    pub fn refusing() -> Self {
        Self::build(true)
    }

    fn build(refuse: bool) -> Self {
        let (remote, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(FakeConnection {
            sent: Mutex::new(Vec::new()),
            inbound: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        });

        FakeRemote {
            connector: Arc::new(FakeConnector {
                connection,
                setups: Mutex::new(Vec::new()),
                refuse,
                attempts: AtomicUsize::new(0),
            }),
            remote,
        }
    }

    pub fn connection(&self) -> &Arc<FakeConnection> {
        &self.connector.connection
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    pub fn push_audio(&self, audio: &[u8]) {
        let _ = self
            .remote
            .send(Ok(RemoteMessage::audio(Bytes::copy_from_slice(audio))));
    }

    pub fn push(&self, message: Inbound) {
        let _ = self.remote.send(message);
    }
}

/// Playback sink that records everything it was asked to play.
#[derive(Default)]
pub struct RecordingSink {
    pub played: Mutex<Vec<Vec<f32>>>,
}

impl RecordingSink {
    pub fn samples_played(&self) -> usize {
        self.played.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl PlaybackSink for RecordingSink {
    async fn play(&self, pcm: Vec<f32>) -> anyhow::Result<()> {
        self.played.lock().unwrap().push(pcm);
        Ok(())
    }
}

/// Settings with the cost guard off and no silence floor.
pub fn test_settings() -> SessionSettings {
    SessionSettings {
        cost_guard_usd: f64::INFINITY,
        ..SessionSettings::default()
    }
}

pub fn session_for(remote: &FakeRemote, guard: CostGuard) -> StreamingSession {
    StreamingSession::new(
        remote.connector(),
        SessionSetup::new("test-model", "test-voice"),
        guard,
    )
}

/// 20ms of a 48kHz stereo tone, loud enough to count as speech.
pub fn speech_frame(speaker: u64) -> CapturedFrame {
    let samples: Vec<i16> = (0..960)
        .flat_map(|i| {
            let t = i as f32 / 48_000.0;
            let s = (0.3 * (2.0 * std::f32::consts::PI * 220.0 * t).sin() * 32767.0) as i16;
            [s, s]
        })
        .collect();
    CapturedFrame::from_i16(speaker, &samples, 2)
}

/// 20ms of 48kHz stereo digital silence.
pub fn silent_frame(speaker: u64) -> CapturedFrame {
    CapturedFrame::from_i16(speaker, &[0i16; 1920], 2)
}

/// Poll `condition` until it holds or the test timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within timeout");
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("operation did not complete within timeout")
}
