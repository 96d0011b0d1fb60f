//! Duplex streaming session with byte-cost accounting.
//!
//! Captured audio goes `send_pcm` -> inbound queue -> send loop -> remote.
//! Remote audio goes receive loop -> outbound queue -> `AudioStream`.
//! Both queues are `BackpressureQueue`s, so a stalled peer costs audio,
//! never memory.

use crate::{
    backpressure::BackpressureQueue,
    constants::SESSION_QUEUE_CAPACITY,
    error::SessionError,
    remote::{Connector, RemoteConnection, RemoteMessage, SessionSetup},
};
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Closed,
}

/// Spending ceiling on the metered remote service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CostGuard {
    pub cost_per_byte_in: f64,
    pub cost_per_byte_out: f64,
    /// `None` disables the guard
    pub ceiling: Option<f64>,
}

impl CostGuard {
    pub fn cost(&self, bytes_in: u64, bytes_out: u64) -> f64 {
        bytes_in as f64 * self.cost_per_byte_in + bytes_out as f64 * self.cost_per_byte_out
    }
}

#[derive(Default)]
struct Meter {
    bytes_in: u64,
    bytes_out: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Shared {
    setup: SessionSetup,
    guard: CostGuard,
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
    connection: Mutex<Option<Arc<dyn RemoteConnection>>>,
    meter: Mutex<Meter>,
    in_q: BackpressureQueue<Bytes>,
    out_q: BackpressureQueue<Bytes>,
    shutdown: CancellationToken,
    /// Why the session closed itself, if it did
    close_reason: Mutex<Option<SessionError>>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    fn connection(&self) -> Option<Arc<dyn RemoteConnection>> {
        lock(&self.connection).clone()
    }

    /// Move to `Closed`. Returns the state we left.
    fn mark_closed(&self) -> SessionState {
        std::mem::replace(&mut *lock(&self.state), SessionState::Closed)
    }

    /// Move from `Active` to `Closed`, true if this call made the transition.
    fn close_if_active(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == SessionState::Active {
            *state = SessionState::Closed;
            true
        } else {
            false
        }
    }

    async fn teardown(&self) {
        self.shutdown.cancel();

        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!("Error while closing remote connection: {e}");
            }
        }

        self.in_q.clear();
        self.out_q.clear();
    }

    /// Close the session if the accumulated cost reached the ceiling.
    ///
    /// Only the caller whose update performs the Active -> Closed transition
    /// gets the error.
    async fn enforce_cost_guard(&self) -> Result<(), SessionError> {
        let Some(ceiling) = self.guard.ceiling else {
            return Ok(());
        };

        let cost = {
            let meter = lock(&self.meter);
            self.guard.cost(meter.bytes_in, meter.bytes_out)
        };

        if cost < ceiling || !self.close_if_active() {
            return Ok(());
        }

        warn!("Cost guard tripped at {cost:.4} (ceiling {ceiling:.4}), closing session");
        let error = SessionError::CostGuardExceeded { cost, ceiling };
        *lock(&self.close_reason) = Some(error.clone());
        self.teardown().await;

        Err(error)
    }

    async fn receive_audio(&self, audio: Bytes) -> Result<(), SessionError> {
        if !self.is_active() {
            return Ok(());
        }

        lock(&self.meter).bytes_out += audio.len() as u64;
        trace!("Received {} bytes of audio", audio.len());
        self.out_q.put(audio);

        self.enforce_cost_guard().await
    }
}

#[derive(Clone)]
pub struct StreamingSession {
    shared: Arc<Shared>,
}

impl StreamingSession {
    pub fn new(connector: Arc<dyn Connector>, setup: SessionSetup, guard: CostGuard) -> Self {
        Self::with_queue_capacity(connector, setup, guard, SESSION_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(
        connector: Arc<dyn Connector>,
        setup: SessionSetup,
        guard: CostGuard,
        capacity: usize,
    ) -> Self {
        StreamingSession {
            shared: Arc::new(Shared {
                setup,
                guard,
                connector,
                state: Mutex::new(SessionState::Uninitialized),
                connection: Mutex::new(None),
                meter: Mutex::new(Meter::default()),
                in_q: BackpressureQueue::new(capacity),
                out_q: BackpressureQueue::new(capacity),
                shutdown: CancellationToken::new(),
                close_reason: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn bytes_in(&self) -> u64 {
        lock(&self.shared.meter).bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        lock(&self.shared.meter).bytes_out
    }

    /// Cost accumulated so far in currency units.
    pub fn cost(&self) -> f64 {
        let meter = lock(&self.shared.meter);
        self.shared.guard.cost(meter.bytes_in, meter.bytes_out)
    }

    /// Set when the session closed itself, e.g. on the cost guard.
    pub fn close_reason(&self) -> Option<SessionError> {
        lock(&self.shared.close_reason).clone()
    }

    /// Payloads waiting to be sent upstream.
    pub fn pending_outbound(&self) -> usize {
        self.shared.in_q.size()
    }

    /// Connect to the remote service. Failures are returned as-is, retrying
    /// is up to the caller.
    pub async fn create(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Active => return Ok(()),
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Uninitialized => {}
        }

        let connection = self.shared.connector.connect(&self.shared.setup).await?;

        {
            let mut state = lock(&self.shared.state);
            if *state == SessionState::Uninitialized {
                *lock(&self.shared.connection) = Some(connection);
                *state = SessionState::Active;
                info!(
                    "Streaming session active (model {}, voice {})",
                    self.shared.setup.model_id, self.shared.setup.voice_name
                );
                return Ok(());
            }
        }

        // Closed while we were connecting
        if let Err(e) = connection.close().await {
            warn!("Error while closing superseded connection: {e}");
        }
        Err(SessionError::Closed)
    }

    /// Queue captured audio for the remote service.
    ///
    /// Silently ignored unless the session is active. Returns
    /// `CostGuardExceeded` if this payload pushed the cost over the ceiling.
    pub async fn send_pcm(&self, payload: Bytes) -> Result<(), SessionError> {
        if !self.shared.is_active() {
            return Ok(());
        }

        lock(&self.shared.meter).bytes_in += payload.len() as u64;
        self.shared.in_q.put(payload);

        self.shared.enforce_cost_guard().await
    }

    /// Spawn the loop forwarding queued payloads to the remote connection.
    ///
    /// The task ends when the session closes, or with an error when the
    /// connection fails.
    pub fn start_send_loop(&self) -> JoinHandle<Result<(), SessionError>> {
        let shared = self.shared.clone();
        tokio::spawn(async move { send_loop(shared).await })
    }

    /// Stream audio produced by the remote service.
    ///
    /// The receive loop runs in the background for as long as the returned
    /// stream is alive. Only one stream should be consumed at a time.
    ///
    /// Dropping the stream aborts the receive loop without waiting for it.
    /// Call `AudioStream::finish` when the loop must have exited before
    /// continuing, e.g. before starting another stream.
    pub fn iter_audio(&self) -> AudioStream {
        let stop = self.shared.shutdown.child_token();

        let recv_task = match self.shared.connection() {
            Some(connection) if self.shared.is_active() => {
                let shared = self.shared.clone();
                let stop = stop.clone();
                Some(tokio::spawn(async move {
                    recv_loop(shared, connection, stop).await
                }))
            }
            _ => None,
        };

        AudioStream {
            done: recv_task.is_none(),
            shared: self.shared.clone(),
            recv_task,
            stop,
        }
    }

    /// Tear down the connection. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.shared.mark_closed() == SessionState::Closed {
            return;
        }

        info!(
            "Closing streaming session ({} bytes in, {} bytes out, cost {:.4})",
            self.bytes_in(),
            self.bytes_out(),
            self.cost()
        );
        self.shared.teardown().await;
    }
}

async fn send_loop(shared: Arc<Shared>) -> Result<(), SessionError> {
    let Some(connection) = shared.connection() else {
        return Ok(());
    };

    loop {
        let payload = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            payload = shared.in_q.get() => payload,
        };

        if !shared.is_active() {
            break;
        }

        let len = payload.len();
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            result = connection.send(payload) => {
                if let Err(e) = result {
                    error!("Failed to send audio to remote: {e}");
                    return Err(e);
                }
            }
        }
        trace!("Sent {len} bytes of audio");
    }

    debug!("Send loop stopped");
    Ok(())
}

async fn recv_loop(
    shared: Arc<Shared>,
    connection: Arc<dyn RemoteConnection>,
    stop: CancellationToken,
) -> Result<(), SessionError> {
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            message = connection.next_message() => message,
        };

        match message {
            None => {
                debug!("Remote audio stream ended");
                return Ok(());
            }
            Some(Err(e)) => {
                error!("Failed to receive from remote: {e}");
                return Err(e);
            }
            Some(Ok(RemoteMessage { audio: Some(audio) })) => shared.receive_audio(audio).await?,
            Some(Ok(_)) => trace!("Ignoring non-audio message"),
        }
    }
}

enum Step {
    Audio(Bytes),
    ReceiverDone(Result<Result<(), SessionError>, JoinError>),
    SessionClosed,
}

/// Audio chunks from the remote service, in delivery order.
///
/// Dropping the stream stops the background receive loop; `finish` also
/// waits for it to wind down.
pub struct AudioStream {
    shared: Arc<Shared>,
    recv_task: Option<JoinHandle<Result<(), SessionError>>>,
    stop: CancellationToken,
    done: bool,
}

impl AudioStream {
    /// Next audio chunk, or `None` once the session is closed or the remote
    /// side ended and everything received has been delivered.
    ///
    /// An error from the receive loop (connection failure, cost guard) is
    /// yielded once, after which the stream ends.
    pub async fn next(&mut self) -> Option<Result<Bytes, SessionError>> {
        loop {
            if self.done {
                return None;
            }

            let Some(task) = self.recv_task.as_mut() else {
                // Receiver finished, deliver what is left
                if self.shared.is_active() {
                    if let Some(chunk) = self.shared.out_q.try_get() {
                        return Some(Ok(chunk));
                    }
                }
                self.done = true;
                return None;
            };

            let shared = &self.shared;
            let step = tokio::select! {
                biased;
                result = task => Step::ReceiverDone(result),
                _ = shared.shutdown.cancelled() => Step::SessionClosed,
                chunk = shared.out_q.get() => Step::Audio(chunk),
            };

            match step {
                Step::Audio(chunk) => return Some(Ok(chunk)),
                Step::ReceiverDone(result) => {
                    self.recv_task = None;
                    if let Some(e) = receiver_error(result) {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
                Step::SessionClosed => {
                    self.done = true;
                    // The receiver may be the one that closed the session
                    if let Some(task) = self.recv_task.take() {
                        if let Some(e) = receiver_error(task.await) {
                            return Some(Err(e));
                        }
                    }
                    return None;
                }
            }
        }
    }

    /// Stop the receive loop and wait until it has exited.
    pub async fn finish(mut self) {
        self.stop.cancel();
        if let Some(task) = self.recv_task.take() {
            let _ = task.await;
        }
    }
}

fn receiver_error(result: Result<Result<(), SessionError>, JoinError>) -> Option<SessionError> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) if e.is_cancelled() => None,
        Err(e) => Some(SessionError::ConnectionError(format!(
            "receive loop failed: {e}"
        ))),
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}
