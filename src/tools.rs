//! External capabilities the generator may invoke mid-reply.
//!
//! A capability failure is data, not an exception: the error text is fed
//! back to the generator as the tool result so it can retry or answer
//! without it. Nothing here is ever fatal to a call.

use crate::llm::ToolSpec;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

/// Error type for capability invocations
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("unknown capability: {0}")]
    Unknown(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("capability failed: {0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, CapabilityError>;

#[async_trait]
pub trait Capability: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn invoke(&self, args: &Value) -> Result<Value>;
}

/// Process-wide set of capabilities advertised to the generator.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Box<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Box<dyn Capability>) {
        let name = capability.spec().name;
        self.capabilities.insert(name, capability);
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.capabilities.values().map(|c| c.spec()).collect()
    }

    pub async fn invoke(&self, name: &str, args: &Value) -> Result<Value> {
        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| CapabilityError::Unknown(name.to_string()))?;
        info!(capability = name, "invoking capability");
        let result = capability.invoke(args).await;
        if let Err(e) = &result {
            warn!(capability = name, error = %e, "capability invocation failed");
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

/// Wall-clock lookup, so the agent can answer "what time is it".
pub struct CurrentTime;

#[async_trait]
impl Capability for CurrentTime {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "current_time".to_string(),
            description: "Get the current date and time (UTC).".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    async fn invoke(&self, _args: &Value) -> Result<Value> {
        Ok(json!({ "now": chrono::Utc::now().to_rfc3339() }))
    }
}

/// Message dispatch over Twilio REST. Once the POST has been issued the
/// message is on its way; reply cancellation never rolls it back.
pub struct SendSms {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    base_url: String,
}

impl SendSms {
    pub fn new(account_sid: String, auth_token: String, from_number: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid,
            auth_token,
            from_number,
            base_url: "https://api.twilio.com".to_string(),
        }
    }
}

#[async_trait]
impl Capability for SendSms {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "send_sms".to_string(),
            description: "Send an SMS text message to a phone number.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "to": {"type": "string", "description": "E.164 phone number"},
                    "body": {"type": "string", "description": "Message text"}
                },
                "required": ["to", "body"]
            }),
        }
    }

    async fn invoke(&self, args: &Value) -> Result<Value> {
        let to = args
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::InvalidArgs("missing 'to'".into()))?;
        let body = args
            .get("body")
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::InvalidArgs("missing 'body'".into()))?;

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        );
        let form = [("From", self.from_number.as_str()), ("To", to), ("Body", body)];

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
            return Err(CapabilityError::Failed(format!("{} - {}", status, text)));
        }

        let result: Value = response.json().await?;
        let sid = result.get("sid").and_then(Value::as_str).unwrap_or_default();
        info!(sid, "SMS dispatched");
        Ok(json!({ "status": "sent", "sid": sid }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    #[async_trait]
    impl Capability for Doubler {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "double".to_string(),
                description: "Double a number.".to_string(),
                parameters: json!({"type": "object", "properties": {"n": {"type": "number"}}}),
            }
        }

        async fn invoke(&self, args: &Value) -> Result<Value> {
            let n = args
                .get("n")
                .and_then(Value::as_i64)
                .ok_or_else(|| CapabilityError::InvalidArgs("missing 'n'".into()))?;
            Ok(json!({"result": n * 2}))
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Box::new(Doubler));
        let result = registry.invoke("double", &json!({"n": 21})).await.unwrap();
        assert_eq!(result["result"], 42);
    }

    #[tokio::test]
    async fn unknown_capability_is_an_error_value() {
        let registry = CapabilityRegistry::new();
        let err = registry.invoke("nope", &Value::Null).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Unknown(_)));
    }

    #[tokio::test]
    async fn invalid_args_surface_as_error() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Box::new(Doubler));
        let err = registry.invoke("double", &json!({})).await.unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn clock_reports_parseable_time() {
        let result = CurrentTime.invoke(&Value::Null).await.unwrap();
        let now = result["now"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(now).is_ok());
    }

    #[test]
    fn specs_advertise_registered_capabilities() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Box::new(Doubler));
        registry.register(Box::new(CurrentTime));
        let mut names: Vec<_> = registry.specs().into_iter().map(|s| s.name).collect();
        names.sort();
        assert_eq!(names, vec!["current_time", "double"]);
    }
}
