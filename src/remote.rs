//! Interface to the remote streaming audio service.
//!
//! The session only depends on the `Connector` and `RemoteConnection`
//! traits. `WebSocketConnector` is the concrete transport used by the bot:
//! one JSON setup frame, then raw PCM in binary frames both ways.

use crate::{
    constants::{REMOTE_INPUT_SAMPLE_RATE, REMOTE_OUTPUT_SAMPLE_RATE},
    error::SessionError,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

/// Parameters negotiated when a session connects.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSetup {
    #[serde(rename = "model")]
    pub model_id: String,
    #[serde(rename = "voice")]
    pub voice_name: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub encoding: String,
}

impl SessionSetup {
    pub fn new(model_id: &str, voice_name: &str) -> Self {
        SessionSetup {
            model_id: model_id.to_string(),
            voice_name: voice_name.to_string(),
            input_sample_rate: REMOTE_INPUT_SAMPLE_RATE,
            output_sample_rate: REMOTE_OUTPUT_SAMPLE_RATE,
            encoding: "s16le".to_string(),
        }
    }
}

/// One inbound message. Only messages carrying audio matter to the session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteMessage {
    pub audio: Option<Bytes>,
}

impl RemoteMessage {
    pub fn audio(audio: impl Into<Bytes>) -> Self {
        RemoteMessage {
            audio: Some(audio.into()),
        }
    }
}

/// An established duplex connection.
///
/// `send` and `next_message` are called concurrently from different tasks.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    async fn send(&self, payload: Bytes) -> Result<(), SessionError>;

    /// Next inbound message, `None` once the remote side has ended.
    async fn next_message(&self) -> Option<Result<RemoteMessage, SessionError>>;

    async fn close(&self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        setup: &SessionSetup,
    ) -> Result<Arc<dyn RemoteConnection>, SessionError>;
}

#[derive(Serialize)]
struct SetupFrame<'a> {
    setup: &'a SessionSetup,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    url: String,
    api_key: Option<String>,
}

impl WebSocketConnector {
    pub fn new(url: &str, api_key: Option<String>) -> Self {
        WebSocketConnector {
            url: url.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        setup: &SessionSetup,
    ) -> Result<Arc<dyn RemoteConnection>, SessionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(SessionError::connection)?;

        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(SessionError::connection)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = connect_async(request)
            .await
            .map_err(SessionError::connection)?;
        let (mut sink, stream) = ws.split();

        let setup_frame =
            serde_json::to_string(&SetupFrame { setup }).map_err(SessionError::connection)?;
        sink.send(Message::Text(setup_frame.into()))
            .await
            .map_err(SessionError::connection)?;

        info!("Connected to remote audio service at {}", self.url);

        Ok(Arc::new(WebSocketConnection {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }))
    }
}

pub struct WebSocketConnection {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl RemoteConnection for WebSocketConnection {
    async fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(payload.to_vec().into()))
            .await
            .map_err(SessionError::connection)
    }

    async fn next_message(&self) -> Option<Result<RemoteMessage, SessionError>> {
        let mut stream = self.stream.lock().await;
        match stream.next().await? {
            Ok(Message::Binary(data)) => Some(Ok(RemoteMessage::audio(Bytes::from(data)))),
            Ok(Message::Close(frame)) => {
                debug!("Remote closed the connection: {frame:?}");
                None
            }
            Ok(_) => Some(Ok(RemoteMessage::default())),
            Err(e) => Some(Err(SessionError::connection(e))),
        }
    }

    async fn close(&self) -> Result<(), SessionError> {
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(SessionError::connection(e)),
        }
    }
}
