//! Reply generation over an OpenAI-compatible `chat/completions` endpoint.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use pmb_core::{
    config::AiConfig,
    errors::Error,
    reply::{ReplyGenerator, ReplyRequest},
    utils::truncate_text,
    Result,
};

#[derive(Clone, Debug)]
pub struct OpenAiReplyGenerator {
    cfg: AiConfig,
    http: reqwest::Client,
}

impl OpenAiReplyGenerator {
    pub fn new(cfg: AiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::External(format!("http client build failed: {e}")))?;
        Ok(Self { cfg, http })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiReplyGenerator {
    async fn generate(&self, req: &ReplyRequest) -> Result<String> {
        let body = build_request_body(&self.cfg, req);

        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::External(format!("openai request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "openai completion failed: {status} {}",
                truncate_text(&body, 200)
            )));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("openai json error: {e}")))?;

        let text = extract_reply(&v)?;
        debug!(chars = text.chars().count(), "reply generated");
        Ok(text)
    }
}

fn build_request_body(cfg: &AiConfig, req: &ReplyRequest) -> Value {
    let user_content = match (&req.sender_name, req.is_group) {
        (Some(name), true) => format!("{name}: {}", req.text),
        _ => req.text.clone(),
    };

    let mut user = json!({ "role": "user", "content": user_content });
    if let Some(name) = req.sender_name.as_deref().and_then(message_name) {
        user["name"] = Value::String(name);
    }

    json!({
        "model": cfg.model,
        "messages": [
            { "role": "system", "content": cfg.system_prompt },
            user,
        ],
    })
}

/// The API only accepts `[A-Za-z0-9_-]{1,64}` as a participant name.
fn message_name(raw: &str) -> Option<String> {
    let name: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(64)
        .collect();
    (!name.is_empty()).then_some(name)
}

fn extract_reply(v: &Value) -> Result<String> {
    let text = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();

    if text.is_empty() {
        return Err(Error::External(
            "openai completion returned empty text".to_string(),
        ));
    }
    Ok(text)
}
