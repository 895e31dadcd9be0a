//! Twilio media-stream wire protocol.
//!
//! Inbound frames arrive as JSON text on the media WebSocket; outbound
//! audio goes back the same way as base64 μ-law `media` frames. Also
//! carries the TwiML webhook answer and the REST trigger for outbound
//! calls, which land in the same session machinery as inbound ones.

use crate::events::AudioChunk;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Error type for telephony boundary operations
#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    #[error("malformed media payload: {0}")]
    MalformedPayload(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, TelephonyError>;

/// Frames Twilio sends on the media stream socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundFrame {
    Connected {},
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMeta,
    },
    Media {
        #[serde(rename = "sequenceNumber")]
        sequence_number: String,
        media: MediaPayload,
    },
    Mark {
        mark: MarkPayload,
    },
    Stop {},
}

#[derive(Debug, Deserialize)]
pub struct StartMeta {
    #[serde(rename = "callSid")]
    pub call_sid: String,
    #[serde(default, rename = "mediaFormat")]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Deserialize)]
pub struct MediaFormat {
    pub encoding: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    /// Base64 μ-law audio.
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Turn a `media` frame into an audio chunk. Rejects undecodable base64
/// and unparseable sequence numbers; the caller drops the chunk.
pub fn chunk_from_media(sequence_number: &str, media: &MediaPayload) -> Result<AudioChunk> {
    let seq = sequence_number
        .parse::<u64>()
        .map_err(|_| TelephonyError::MalformedPayload(format!("bad sequence {}", sequence_number)))?;
    let payload = base64::engine::general_purpose::STANDARD
        .decode(&media.payload)
        .map_err(|e| TelephonyError::MalformedPayload(e.to_string()))?;
    Ok(AudioChunk { seq, payload })
}

/// Outbound `media` frame carrying μ-law bytes to the caller.
pub fn media_frame(stream_sid: &str, mulaw: &[u8]) -> String {
    json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": {
            "payload": base64::engine::general_purpose::STANDARD.encode(mulaw),
        }
    })
    .to_string()
}

/// Outbound `clear` frame: flush buffered audio provider-side so a
/// cancelled reply stops promptly.
pub fn clear_frame(stream_sid: &str) -> String {
    json!({ "event": "clear", "streamSid": stream_sid }).to_string()
}

/// TwiML answer for the voice webhook: connect the call to our media
/// stream socket.
pub fn connect_stream_twiml(ws_url: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Response><Connect><Stream url=\"{}\"/></Connect></Response>",
        ws_url
    )
}

/// Outbound-call trigger over Twilio REST. The connected call is answered
/// by the same webhook and lands in the same session machinery.
pub struct TwilioDialer {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    base_url: String,
}

impl TwilioDialer {
    pub fn new(account_sid: String, auth_token: String, from_number: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid,
            auth_token,
            from_number,
            base_url: "https://api.twilio.com".to_string(),
        }
    }

    /// Start a call to `to`; Twilio fetches TwiML from `webhook_url` once
    /// the callee answers. Returns the call SID.
    pub async fn start_call(&self, to: &str, webhook_url: &str) -> Result<String> {
        info!(to, "initiating outbound call");
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.base_url, self.account_sid
        );
        let form = [
            ("To", to),
            ("From", self.from_number.as_str()),
            ("Url", webhook_url),
            ("Method", "POST"),
        ];

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TelephonyError::Api(format!("{} - {}", status, text)));
        }

        #[derive(Deserialize)]
        struct CallResponse {
            sid: String,
        }
        let call: CallResponse = response.json().await?;
        info!(sid = %call.sid, "outbound call created");
        Ok(call.sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_frame() {
        let text = r#"{
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ123",
            "start": {
                "streamSid": "MZ123",
                "accountSid": "AC1",
                "callSid": "CA1",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        }"#;
        match InboundFrame::parse(text).unwrap() {
            InboundFrame::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ123");
                assert_eq!(start.call_sid, "CA1");
                assert_eq!(start.media_format.unwrap().sample_rate, 8000);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn parses_media_frame_into_chunk() {
        let payload = base64::engine::general_purpose::STANDARD.encode([0xFFu8, 0x7F]);
        let text = format!(
            r#"{{"event":"media","sequenceNumber":"42","streamSid":"MZ123",
                "media":{{"track":"inbound","chunk":"2","timestamp":"80","payload":"{}"}}}}"#,
            payload
        );
        match InboundFrame::parse(&text).unwrap() {
            InboundFrame::Media { sequence_number, media } => {
                let chunk = chunk_from_media(&sequence_number, &media).unwrap();
                assert_eq!(chunk.seq, 42);
                assert_eq!(chunk.payload, vec![0xFF, 0x7F]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn undecodable_payload_is_malformed_not_fatal() {
        let media = MediaPayload { payload: "!!not base64!!".to_string() };
        assert!(matches!(
            chunk_from_media("1", &media),
            Err(TelephonyError::MalformedPayload(_))
        ));
        let media = MediaPayload { payload: String::new() };
        assert!(matches!(
            chunk_from_media("nan", &media),
            Err(TelephonyError::MalformedPayload(_))
        ));
    }

    #[test]
    fn parses_stop_mark_connected() {
        assert!(matches!(
            InboundFrame::parse(r#"{"event":"connected","protocol":"Call","version":"1.0.0"}"#),
            Some(InboundFrame::Connected {})
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"event":"stop","sequenceNumber":"9","streamSid":"MZ1","stop":{}}"#),
            Some(InboundFrame::Stop {})
        ));
        match InboundFrame::parse(r#"{"event":"mark","streamSid":"MZ1","mark":{"name":"m1"}}"#) {
            Some(InboundFrame::Mark { mark }) => assert_eq!(mark.name, "m1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn outbound_media_frame_round_trips_payload() {
        let frame = media_frame("MZ9", &[0xFF, 0x00, 0x7F]);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ9");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(value["media"]["payload"].as_str().unwrap())
            .unwrap();
        assert_eq!(bytes, vec![0xFF, 0x00, 0x7F]);
    }

    #[test]
    fn clear_frame_names_the_stream() {
        let value: serde_json::Value = serde_json::from_str(&clear_frame("MZ9")).unwrap();
        assert_eq!(value["event"], "clear");
        assert_eq!(value["streamSid"], "MZ9");
    }

    #[test]
    fn twiml_connects_the_stream() {
        let twiml = connect_stream_twiml("wss://example.org/media-stream");
        assert!(twiml.contains("<Connect><Stream url=\"wss://example.org/media-stream\"/>"));
        assert!(twiml.starts_with("<?xml"));
    }
}
