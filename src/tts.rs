//! Text-to-speech transducer.
//!
//! `synthesize` returns a lazy stream of linear PCM sample chunks over a
//! channel; the live implementation streams μ-law from ElevenLabs and
//! decodes it at the boundary so the rest of the pipeline deals only in
//! samples.

use crate::codec;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Error type for speech synthesis
#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, TtsError>;

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Start synthesis and return the ordered stream of sample chunks.
    /// The channel closes when synthesis is complete.
    async fn synthesize(&self, text: &str) -> Result<mpsc::Receiver<Vec<i16>>>;
}

/// ElevenLabs streaming synthesis, μ-law 8 kHz output (the Twilio-native
/// format), decoded to samples as chunks arrive.
pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
    base_url: String,
}

impl ElevenLabsTts {
    pub fn new(api_key: String, voice_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            voice_id,
            base_url: "https://api.elevenlabs.io".to_string(),
        }
    }
}

#[async_trait]
impl TextToSpeech for ElevenLabsTts {
    async fn synthesize(&self, text: &str) -> Result<mpsc::Receiver<Vec<i16>>> {
        let url = format!("{}/v1/text-to-speech/{}/stream", self.base_url, self.voice_id);
        let body = json!({
            "text": text,
            "model_id": "eleven_multilingual_v2",
            "voice_settings": { "stability": 0.5, "similarity_boost": 0.75 },
        });

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .query(&[("output_format", "ulaw_8000")])
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TtsError::Api(format!("{} - {}", status, text)));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if bytes.is_empty() {
                            continue;
                        }
                        debug!(bytes = bytes.len(), "TTS chunk received");
                        if tx.send(codec::decode_mulaw(&bytes)).await.is_err() {
                            // Receiver dropped: the reply was cancelled.
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "TTS stream error, ending synthesis");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Deterministic synthesis for mock mode and tests: one 20 ms frame per
/// byte of input text, each frame a constant derived from that byte.
pub struct MockTts;

/// Samples per frame at 8 kHz, 20 ms.
pub const MOCK_FRAME_SAMPLES: usize = 160;

#[async_trait]
impl TextToSpeech for MockTts {
    async fn synthesize(&self, text: &str) -> Result<mpsc::Receiver<Vec<i16>>> {
        let bytes: Vec<u8> = text.bytes().collect();
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for b in bytes {
                let value = (b as i16 - 64) * 128;
                if tx.send(vec![value; MOCK_FRAME_SAMPLES]).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: mpsc::Receiver<Vec<i16>>) -> Vec<Vec<i16>> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    #[tokio::test]
    async fn mock_is_deterministic() {
        let a = collect(MockTts.synthesize("hi").await.unwrap()).await;
        let b = collect(MockTts.synthesize("hi").await.unwrap()).await;
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].len(), MOCK_FRAME_SAMPLES);
    }

    #[tokio::test]
    async fn mock_frame_count_tracks_text_length() {
        let frames = collect(MockTts.synthesize("hello world").await.unwrap()).await;
        assert_eq!(frames.len(), "hello world".len());
    }

    #[tokio::test]
    async fn empty_text_synthesizes_nothing() {
        let frames = collect(MockTts.synthesize("").await.unwrap()).await;
        assert!(frames.is_empty());
    }
}
