//! Speech-to-text transducer.
//!
//! One instance per call. The live implementation speaks the Deepgram
//! realtime protocol over a WebSocket: linear16 audio up, JSON results
//! down. A background reader task turns results into `TranscriptEvent`s
//! on an mpsc channel, assigning the per-call strictly increasing
//! sequence numbers the aggregator's ordering contract relies on.

use crate::codec;
use crate::events::TranscriptEvent;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

/// Error type for STT transducer operations
#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transducer closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SttError>;

#[async_trait]
pub trait SpeechToText: Send {
    /// Forward one chunk of linear PCM caller audio.
    async fn send_audio(&mut self, samples: &[i16]) -> Result<()>;

    /// Release provider-side resources. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Deepgram live transcription client.
pub struct DeepgramStt {
    sink: WsSink,
    closed: bool,
}

impl DeepgramStt {
    /// Connect a live transcription socket and return the transducer handle
    /// together with its transcript event stream.
    pub async fn connect(
        api_key: &str,
        model: &str,
    ) -> Result<(Self, mpsc::Receiver<TranscriptEvent>)> {
        let url = format!(
            "wss://api.deepgram.com/v1/listen?model={}&language=en-US\
             &encoding=linear16&sample_rate=8000&channels=1\
             &smart_format=true&interim_results=true",
            model
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| SttError::InvalidRequest(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", api_key))
            .map_err(|e| SttError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        info!("connecting STT transducer");
        let (ws, _response) = connect_async(request).await?;
        let (sink, mut stream) = ws.split();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut sequence: u64 = 0;
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(mut event) = parse_result(&text) {
                            // Partial noise (empty interim results) is not
                            // worth a channel hop; finals always go through.
                            if !event.is_final && event.text.trim().is_empty() {
                                continue;
                            }
                            sequence += 1;
                            event.sequence = sequence;
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("STT transducer closed the stream");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "STT socket error");
                        break;
                    }
                }
            }
        });

        Ok((Self { sink, closed: false }, rx))
    }
}

/// Parse one Deepgram realtime result frame into a transcript event.
/// Sequence is assigned by the reader loop.
fn parse_result(text: &str) -> Option<TranscriptEvent> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type").and_then(|t| t.as_str()) != Some("Results") {
        return None;
    }
    let alternative = value
        .get("channel")?
        .get("alternatives")?
        .get(0)?;
    let transcript = alternative.get("transcript")?.as_str()?.to_string();
    let confidence = alternative
        .get("confidence")
        .and_then(|c| c.as_f64())
        .map(|c| c as f32);
    let is_final = value
        .get("is_final")
        .and_then(|f| f.as_bool())
        .unwrap_or(false);
    debug!(is_final, len = transcript.len(), "transcript result");
    Some(TranscriptEvent { text: transcript, is_final, sequence: 0, confidence })
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    async fn send_audio(&mut self, samples: &[i16]) -> Result<()> {
        if self.closed {
            return Err(SttError::Closed);
        }
        let bytes = codec::samples_to_le_bytes(samples);
        self.sink.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Ask the provider to flush its final results, then close cleanly.
        let _ = self
            .sink
            .send(Message::Text("{\"type\":\"CloseStream\"}".into()))
            .await;
        let _ = self.sink.close().await;
        info!("STT transducer released");
        Ok(())
    }
}

/// Deterministic transducer for mock mode: after every two seconds of
/// received audio it emits a partial and then a final from a fixed script.
pub struct MockStt {
    tx: Option<mpsc::Sender<TranscriptEvent>>,
    script: Vec<String>,
    next_line: usize,
    samples_seen: usize,
    sequence: u64,
}

/// Audio to accumulate before the mock "hears" one utterance: 2 s at 8 kHz.
pub const MOCK_UTTERANCE_SAMPLES: usize = 16_000;

impl MockStt {
    pub fn start(script: Vec<String>) -> (Self, mpsc::Receiver<TranscriptEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self { tx: Some(tx), script, next_line: 0, samples_seen: 0, sequence: 0 },
            rx,
        )
    }

    fn next_event(&mut self, is_final: bool) -> TranscriptEvent {
        let text = if is_final {
            let line = self.script[self.next_line % self.script.len()].clone();
            self.next_line += 1;
            line
        } else {
            String::new()
        };
        self.sequence += 1;
        TranscriptEvent { text, is_final, sequence: self.sequence, confidence: Some(1.0) }
    }
}

#[async_trait]
impl SpeechToText for MockStt {
    async fn send_audio(&mut self, samples: &[i16]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(SttError::Closed)?.clone();
        self.samples_seen += samples.len();
        if self.samples_seen >= MOCK_UTTERANCE_SAMPLES {
            self.samples_seen = 0;
            let final_event = self.next_event(true);
            if tx.send(final_event).await.is_err() {
                return Err(SttError::Closed);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender closes the event stream.
        self.tx.take();
        Ok(())
    }
}
