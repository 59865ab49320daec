//! Wire formats for the three supported providers: OpenAI chat completions,
//! an OpenAI-compatible vLLM endpoint, and the Google generative API.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::config_service::{GeminiProviderConfig, OpenAiProviderConfig, VllmProviderConfig};

use super::{LlmError, TextStream};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

fn map_transport(provider: &'static str, err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout { provider }
    } else {
        LlmError::Network(err)
    }
}

/// Turn a non-success status into the matching gateway error, reading the
/// body for diagnostics.
async fn check_status(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    match status.as_u16() {
        429 => Err(LlmError::RateLimited { provider, message }),
        401 | 403 => Err(LlmError::Auth(message)),
        code => Err(LlmError::Api {
            provider,
            status: code,
            message,
        }),
    }
}

fn build_prompt(prompt: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.is_empty() => {
            format!("Context:\n{ctx}\n\nUser Request:\n{prompt}")
        }
        _ => prompt.to_string(),
    }
}

fn openai_messages(prompt: &str, context: Option<&str>) -> Value {
    let mut messages = Vec::new();
    if let Some(ctx) = context {
        if !ctx.is_empty() {
            messages.push(json!({"role": "system", "content": format!("Context:\n{ctx}")}));
        }
    }
    messages.push(json!({"role": "user", "content": prompt}));
    Value::Array(messages)
}

fn openai_payload(model: &str, messages: Value, max_tokens: u32, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": messages,
        "max_tokens": max_tokens,
        "temperature": 0.7,
        "stream": stream,
    })
}

fn gemini_payload(prompt: &str) -> Value {
    json!({
        "contents": [{"parts": [{"text": prompt}]}],
        "generationConfig": {
            "temperature": 0.7,
            "topK": 40,
            "topP": 0.95,
            "maxOutputTokens": 4096,
        },
        "safetySettings": [
            {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_MEDIUM_AND_ABOVE"},
            {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_MEDIUM_AND_ABOVE"},
            {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_MEDIUM_AND_ABOVE"},
            {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_MEDIUM_AND_ABOVE"}
        ],
    })
}

fn parse_openai_response(provider: &'static str, data: &Value) -> Result<String, LlmError> {
    let choice = data
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or(LlmError::EmptyResponse { provider })?;

    if let Some(content) = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        return Ok(content.to_string());
    }
    if let Some(text) = choice.get("text").and_then(Value::as_str) {
        return Ok(text.to_string());
    }
    Err(LlmError::EmptyResponse { provider })
}

fn extract_gemini_text(data: &Value) -> Option<String> {
    data.get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
        .map(str::to_string)
}

fn extract_openai_delta(data: &Value) -> Option<String> {
    data.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

/// Wrap a provider SSE body into the gateway's delta stream. Deltas are
/// yielded strictly in source order; a transport error ends the stream.
fn sse_text_stream(
    provider: &'static str,
    response: reqwest::Response,
    extract: fn(&Value) -> Option<String>,
) -> TextStream {
    let stream = async_stream::stream! {
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    if event.data == "[DONE]" {
                        break;
                    }
                    if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                        if let Some(delta) = extract(&value) {
                            if !delta.is_empty() {
                                yield Ok(delta);
                            }
                        }
                    }
                }
                Err(err) => {
                    yield Err(LlmError::Stream {
                        provider,
                        message: err.to_string(),
                    });
                    break;
                }
            }
        }
    };
    Box::pin(stream)
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

pub async fn openai_generate(
    http: &reqwest::Client,
    cfg: &OpenAiProviderConfig,
    prompt: &str,
    context: Option<&str>,
    timeout: Duration,
) -> Result<String, LlmError> {
    let key = cfg
        .api_key
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| LlmError::NotConfigured("openai api_key".into()))?;

    let payload = openai_payload(&cfg.model, openai_messages(prompt, context), 2000, false);
    debug!(model = %cfg.model, "calling openai");

    let response = http
        .post(OPENAI_URL)
        .bearer_auth(key)
        .json(&payload)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| map_transport("openai", e))?;

    let response = check_status("openai", response).await?;
    let data: Value = response
        .json()
        .await
        .map_err(|e| map_transport("openai", e))?;
    parse_openai_response("openai", &data)
}

pub async fn openai_stream(
    http: &reqwest::Client,
    cfg: &OpenAiProviderConfig,
    prompt: &str,
    context: Option<&str>,
    timeout: Duration,
) -> Result<TextStream, LlmError> {
    let key = cfg
        .api_key
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| LlmError::NotConfigured("openai api_key".into()))?;

    let payload = openai_payload(&cfg.model, openai_messages(prompt, context), 2000, true);

    let response = http
        .post(OPENAI_URL)
        .bearer_auth(key)
        .json(&payload)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| map_transport("openai", e))?;

    let response = check_status("openai", response).await?;
    Ok(sse_text_stream("openai", response, extract_openai_delta))
}

// ---------------------------------------------------------------------------
// vLLM (OpenAI-compatible remote endpoint)
// ---------------------------------------------------------------------------

fn vllm_url(cfg: &VllmProviderConfig) -> String {
    format!("{}/v1/chat/completions", cfg.endpoint.trim_end_matches('/'))
}

pub async fn vllm_generate(
    http: &reqwest::Client,
    cfg: &VllmProviderConfig,
    prompt: &str,
    context: Option<&str>,
    timeout: Duration,
) -> Result<String, LlmError> {
    let full_prompt = build_prompt(prompt, context);
    let messages = json!([{"role": "user", "content": full_prompt}]);
    let payload = openai_payload(&cfg.model, messages, 4096, false);
    debug!(endpoint = %cfg.endpoint, model = %cfg.model, "calling vllm");

    let mut request = http.post(vllm_url(cfg)).json(&payload).timeout(timeout);
    if let Some(key) = cfg.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        request = request.bearer_auth(key);
    }

    let response = request.send().await.map_err(|e| map_transport("vllm", e))?;
    let response = check_status("vllm", response).await?;
    let data: Value = response
        .json()
        .await
        .map_err(|e| map_transport("vllm", e))?;
    parse_openai_response("vllm", &data)
}

pub async fn vllm_stream(
    http: &reqwest::Client,
    cfg: &VllmProviderConfig,
    prompt: &str,
    context: Option<&str>,
    timeout: Duration,
) -> Result<TextStream, LlmError> {
    let full_prompt = build_prompt(prompt, context);
    let messages = json!([{"role": "user", "content": full_prompt}]);
    let payload = openai_payload(&cfg.model, messages, 4096, true);

    let mut request = http.post(vllm_url(cfg)).json(&payload).timeout(timeout);
    if let Some(key) = cfg.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        request = request.bearer_auth(key);
    }

    let response = request.send().await.map_err(|e| map_transport("vllm", e))?;
    let response = check_status("vllm", response).await?;
    Ok(sse_text_stream("vllm", response, extract_openai_delta))
}

// ---------------------------------------------------------------------------
// Gemini (Google generative endpoint)
// ---------------------------------------------------------------------------

pub async fn gemini_generate(
    http: &reqwest::Client,
    cfg: &GeminiProviderConfig,
    api_key: &str,
    prompt: &str,
    context: Option<&str>,
    timeout: Duration,
) -> Result<String, LlmError> {
    let url = format!("{GEMINI_BASE}/{}:generateContent?key={api_key}", cfg.model);
    let payload = gemini_payload(&build_prompt(prompt, context));
    debug!(model = %cfg.model, "calling gemini");

    let response = http
        .post(&url)
        .json(&payload)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| map_transport("gemini", e))?;

    let response = check_status("gemini", response).await?;
    let data: Value = response
        .json()
        .await
        .map_err(|e| map_transport("gemini", e))?;
    extract_gemini_text(&data).ok_or(LlmError::EmptyResponse { provider: "gemini" })
}

pub async fn gemini_stream(
    http: &reqwest::Client,
    cfg: &GeminiProviderConfig,
    api_key: &str,
    prompt: &str,
    context: Option<&str>,
    timeout: Duration,
) -> Result<TextStream, LlmError> {
    let url = format!(
        "{GEMINI_BASE}/{}:streamGenerateContent?key={api_key}&alt=sse",
        cfg.model
    );
    let payload = gemini_payload(&build_prompt(prompt, context));

    let response = http
        .post(&url)
        .json(&payload)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| map_transport("gemini", e))?;

    let response = check_status("gemini", response).await?;
    Ok(sse_text_stream("gemini", response, |v| {
        extract_gemini_text(v)
    }))
}

/// Cheap meta-call used to validate a key before it enters the rotation
/// pool: list the available models.
pub async fn gemini_validate_key(http: &reqwest::Client, api_key: &str) -> Result<(), LlmError> {
    let url = format!("{GEMINI_BASE}?key={api_key}");

    let response = http
        .get(&url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| map_transport("gemini", e))?;

    check_status("gemini", response).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_builder_prepends_context() {
        assert_eq!(build_prompt("do it", None), "do it");
        assert_eq!(
            build_prompt("do it", Some("history")),
            "Context:\nhistory\n\nUser Request:\ndo it"
        );
        assert_eq!(build_prompt("do it", Some("")), "do it");
    }

    #[test]
    fn openai_messages_include_system_context() {
        let messages = openai_messages("hello", Some("prior turns"));
        let arr = messages.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["role"], "system");
        assert_eq!(arr[1]["content"], "hello");
    }

    #[test]
    fn parses_both_openai_response_shapes() {
        let chat = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(parse_openai_response("openai", &chat).unwrap(), "hi");

        let completion = json!({"choices": [{"text": "legacy"}]});
        assert_eq!(
            parse_openai_response("openai", &completion).unwrap(),
            "legacy"
        );

        let empty = json!({"choices": []});
        assert!(parse_openai_response("openai", &empty).is_err());
    }

    #[test]
    fn extracts_gemini_candidate_text() {
        let data = json!({
            "candidates": [{"content": {"parts": [{"text": "answer"}]}}]
        });
        assert_eq!(extract_gemini_text(&data).as_deref(), Some("answer"));
        assert!(extract_gemini_text(&json!({})).is_none());
    }

    #[test]
    fn extracts_openai_stream_delta() {
        let data = json!({"choices": [{"delta": {"content": "tok"}}]});
        assert_eq!(extract_openai_delta(&data).as_deref(), Some("tok"));

        let done = json!({"choices": [{"delta": {}}]});
        assert!(extract_openai_delta(&done).is_none());
    }

    #[test]
    fn vllm_url_normalizes_trailing_slash() {
        let cfg = VllmProviderConfig {
            endpoint: "http://localhost:8000/".into(),
            model: "default".into(),
            api_key: None,
        };
        assert_eq!(vllm_url(&cfg), "http://localhost:8000/v1/chat/completions");
    }
}
