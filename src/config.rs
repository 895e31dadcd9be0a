//! Environment-driven configuration. A `.env` file is honored when
//! present; live mode requires the provider credentials, mock mode runs
//! entirely in-process with deterministic transducers.

use std::time::Duration;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful and concise voice assistant. \
Since you are speaking over the phone, keep your responses brief, clear, and natural \
for speech. Avoid long lists or complex explanations. You are having a real-time \
conversation.";

const DEFAULT_FALLBACK: &str = "Sorry, I'm having trouble right now. Could you say that again?";

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the webhook + media-stream server.
    pub bind_addr: String,
    /// Externally reachable host used to build the stream URL in TwiML.
    pub public_host: String,
    /// Swap all external collaborators for deterministic in-process fakes.
    pub mock_mode: bool,
    /// Exchanges of short-term context sent to the generator.
    pub max_context_turns: usize,
    /// Capability invocations allowed per reply.
    pub tool_loop_limit: usize,
    /// Budget for each external generation/synthesis step.
    pub reply_timeout: Duration,
    /// Concurrent-call ceiling for the registry.
    pub max_calls: usize,
    /// Spoken when the stream starts; empty disables.
    pub greeting: String,
    /// Spoken when a reply task fails.
    pub fallback_text: String,
    pub system_prompt: String,

    pub deepgram_api_key: String,
    pub stt_model: String,
    pub elevenlabs_api_key: String,
    pub elevenlabs_voice_id: String,
    pub openrouter_api_key: String,
    pub openrouter_model: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_phone_number: String,
}

fn flag(value: Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true") | Some("yes") | Some("on"))
}

fn parse<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name, raw)),
    }
}

fn required(name: &'static str) -> Result<String> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

impl Config {
    /// Load from the process environment (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let var = |name: &str| std::env::var(name).ok();

        let mock_mode = flag(var("WIRELIVE_MOCK_MODE"));
        let mut config = Self::mock();
        config.mock_mode = mock_mode;

        config.bind_addr = var("WIRELIVE_BIND").unwrap_or_else(|| "0.0.0.0:8000".to_string());
        if let Some(host) = var("PUBLIC_HOST") {
            config.public_host = host;
        }
        config.max_context_turns =
            parse("WIRELIVE_MAX_CONTEXT_TURNS", var("WIRELIVE_MAX_CONTEXT_TURNS"), 8)?;
        config.tool_loop_limit =
            parse("WIRELIVE_TOOL_LOOP_LIMIT", var("WIRELIVE_TOOL_LOOP_LIMIT"), 4)?;
        let timeout_ms: u64 =
            parse("WIRELIVE_REPLY_TIMEOUT_MS", var("WIRELIVE_REPLY_TIMEOUT_MS"), 30_000)?;
        config.reply_timeout = Duration::from_millis(timeout_ms);
        config.max_calls = parse("WIRELIVE_MAX_CALLS", var("WIRELIVE_MAX_CALLS"), 32)?;
        if let Some(greeting) = var("WIRELIVE_GREETING") {
            config.greeting = greeting;
        }
        if let Some(prompt) = var("WIRELIVE_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
        }
        config.stt_model = var("DEEPGRAM_MODEL").unwrap_or_else(|| "nova-2".to_string());
        config.openrouter_model =
            var("OPENROUTER_MODEL").unwrap_or_else(|| "openai/gpt-4o-mini".to_string());
        config.elevenlabs_voice_id =
            var("ELEVENLABS_VOICE_ID").unwrap_or_else(|| "21m00Tcm4TlvDq8ikWAM".to_string());

        if !mock_mode {
            config.deepgram_api_key = required("DEEPGRAM_API_KEY")?;
            config.elevenlabs_api_key = required("ELEVENLABS_API_KEY")?;
            config.openrouter_api_key = required("OPENROUTER_API_KEY")?;
            config.twilio_account_sid = required("TWILIO_ACCOUNT_SID")?;
            config.twilio_auth_token = required("TWILIO_AUTH_TOKEN")?;
            config.twilio_phone_number = required("TWILIO_PHONE_NUMBER")?;
        }

        Ok(config)
    }

    /// A fully in-process configuration: deterministic transducers, no
    /// credentials, short timeouts suitable for tests.
    pub fn mock() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            public_host: "localhost:8000".to_string(),
            mock_mode: true,
            max_context_turns: 8,
            tool_loop_limit: 4,
            reply_timeout: Duration::from_secs(30),
            max_calls: 32,
            greeting: "Hello! How can I help you today?".to_string(),
            fallback_text: DEFAULT_FALLBACK.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            deepgram_api_key: String::new(),
            stt_model: "nova-2".to_string(),
            elevenlabs_api_key: String::new(),
            elevenlabs_voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            openrouter_api_key: String::new(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            twilio_account_sid: String::new(),
            twilio_auth_token: String::new(),
            twilio_phone_number: String::new(),
        }
    }
}
