use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use gemcode_core::{
    FunctionDeclaration, LlmConfig, Message, ModelTurn, Part, Role, TokenUsage, ToolCallRequest,
};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::thread;
use std::time::Duration;

/// Base delay for network/transport error retries (1s, 2s, 4s exponential backoff).
const NETWORK_RETRY_BASE_MS: u64 = 1000;

/// One model call: the full conversation so far plus the advertised tool
/// schemas, returning whatever the model produced this round.
pub trait ModelClient {
    fn generate_turn(
        &self,
        history: &[Message],
        tools: &[FunctionDeclaration],
        system_instruction: &str,
    ) -> Result<ModelTurn>;
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    cfg: LlmConfig,
    client: Client,
}

impl GeminiClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn resolve_api_key(&self) -> Result<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("{} environment variable not set", self.cfg.api_key_env))
    }

    fn request_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.cfg.endpoint.trim_end_matches('/'),
            self.cfg.model
        )
    }

    fn generate_inner(&self, payload: &Value, api_key: &str) -> Result<ModelTurn> {
        let url = self.request_url();
        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&url)
                .header("x-goog-api-key", api_key)
                .json(payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text()?;
                    if status.is_success() {
                        return parse_turn(&body);
                    }
                    last_err = Some(format_api_error(
                        status,
                        &body,
                        attempt,
                        self.cfg.max_retries,
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("generateContent request failed without detail")))
    }
}

impl ModelClient for GeminiClient {
    fn generate_turn(
        &self,
        history: &[Message],
        tools: &[FunctionDeclaration],
        system_instruction: &str,
    ) -> Result<ModelTurn> {
        let key = self.resolve_api_key()?;
        let payload = build_payload(history, tools, system_instruction);
        self.generate_inner(&payload, &key)
    }
}

/// Build the generateContent request body from the conversation history.
pub fn build_payload(
    history: &[Message],
    tools: &[FunctionDeclaration],
    system_instruction: &str,
) -> Value {
    let contents: Vec<Value> = history
        .iter()
        .map(|msg| {
            let parts: Vec<Value> = msg.parts.iter().map(part_to_wire).collect();
            json!({"role": role_name(msg.role), "parts": parts})
        })
        .collect();

    let mut payload = json!({"contents": contents});
    if !system_instruction.is_empty() {
        payload["systemInstruction"] = json!({"parts": [{"text": system_instruction}]});
    }
    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|decl| {
                json!({
                    "name": decl.name,
                    "description": decl.description,
                    "parameters": decl.parameters
                })
            })
            .collect();
        payload["tools"] = json!([{"functionDeclarations": declarations}]);
    }
    payload
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
        Role::Tool => "tool",
    }
}

fn part_to_wire(part: &Part) -> Value {
    match part {
        Part::Text { text } => json!({"text": text}),
        Part::FunctionCall { name, args } => {
            json!({"functionCall": {"name": name, "args": args}})
        }
        Part::FunctionResponse { name, response } => {
            json!({"functionResponse": {"name": name, "response": response}})
        }
    }
}

/// Parse a generateContent response body into a model turn.
///
/// A missing `usageMetadata` block yields `usage: None` rather than an error;
/// the loop treats such a turn as malformed and decides whether to retry.
pub fn parse_turn(body: &str) -> Result<ModelTurn> {
    let value: Value = serde_json::from_str(body)?;
    let parts = value
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("unexpected generateContent payload: missing candidates[0].content.parts"))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        if let Some(fragment) = part.get("text").and_then(|v| v.as_str()) {
            text.push_str(fragment);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                continue;
            }
            let args = call
                .get("args")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            tool_calls.push(ToolCallRequest { name, args });
        }
    }

    let usage = value.get("usageMetadata").map(|meta| TokenUsage {
        prompt_tokens: meta
            .get("promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        response_tokens: meta
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    });

    Ok(ModelTurn {
        text: if text.is_empty() { None } else { Some(text) },
        tool_calls,
        usage,
    })
}

/// Produce a user-friendly error from a Gemini API HTTP response.
fn format_api_error(status: StatusCode, body: &str, attempt: u8, max_retries: u8) -> anyhow::Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => anyhow!(
            "Invalid or missing API key (HTTP {}).\n\
             Set the GEMINI_API_KEY environment variable.\n\
             Get an API key at https://aistudio.google.com/apikey",
            status.as_u16()
        ),
        StatusCode::TOO_MANY_REQUESTS => anyhow!(
            "Rate limited (HTTP 429). Exhausted {}/{} retries. Try again shortly or reduce request frequency. Detail: {}",
            attempt + 1,
            max_retries + 1,
            detail
        ),
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => anyhow!(
            "Gemini server error (HTTP {}). Exhausted {}/{} retries. The service may be temporarily unavailable. Detail: {}",
            status.as_u16(),
            attempt + 1,
            max_retries + 1,
            detail
        ),
        _ => anyhow!("Gemini API error (HTTP {}): {}", status.as_u16(), detail),
    }
}

/// Produce a user-friendly error from a transport/network failure.
fn format_transport_error(err: &reqwest::Error) -> anyhow::Error {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host")
        || inner_msg.contains("getaddrinfo");

    if err.is_timeout() {
        anyhow!(
            "Request timed out. The Gemini API did not respond in time.\n\
             Retrying with exponential backoff. If this persists, try increasing \
             llm.timeout_seconds in your settings."
        )
    } else if is_dns {
        anyhow!(
            "DNS resolution failed. Could not resolve the Gemini API hostname.\n\
             Check your internet connection and DNS settings. \
             Retrying with exponential backoff."
        )
    } else if err.is_connect() {
        anyhow!(
            "Connection refused. Could not reach the Gemini API at the configured endpoint.\n\
             Check your network connection and firewall settings. \
             Retrying with exponential backoff."
        )
    } else {
        anyhow!("Network error: {err}. Retrying with exponential backoff if retries remain.")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let now = Utc::now();
    let delta = retry_at.signed_duration_since(now).num_seconds();
    Some(delta.max(0) as u64)
}

fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponent = u32::from(attempt);
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}
