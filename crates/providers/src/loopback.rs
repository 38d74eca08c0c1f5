//! Loopback channel: an OpenAI-compatible streaming server on the same
//! device (multimodal helper process) or a routed remote endpoint.
//!
//! Flat prompts go to `/completions`, structured prompts to
//! `/chat/completions`. `reasoning_content` deltas are re-wrapped in
//! `<think>` tags so the session's marker parser handles them like
//! in-band reasoning from a native runtime.

use std::time::Duration;

use lt_domain::config::{Channel, LoopbackConfig};
use lt_domain::error::{Error, Result};
use lt_domain::stream::TokenStream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::traits::{ChunkMode, GenerationRequest, RenderedPrompt, TokenSource};

fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Pull complete `data:` payloads out of an SSE buffer, leaving any
/// trailing partial event in place.
pub(crate) fn take_sse_payloads(buffer: &mut String) -> Vec<String> {
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();
        payloads.extend(
            block
                .lines()
                .filter_map(|line| line.trim().strip_prefix("data:"))
                .map(str::trim)
                .filter(|data| !data.is_empty())
                .map(str::to_string),
        );
    }
    payloads
}

/// Decode the complete UTF-8 prefix of `pending`, keeping a character
/// split across network chunks for the next call. Invalid bytes are
/// replaced rather than held.
pub(crate) fn take_utf8(pending: &mut Vec<u8>) -> String {
    let complete = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let text = String::from_utf8_lossy(&pending[..complete]).into_owned();
    pending.drain(..complete);
    text
}

/// Tracks whether a `<think>` wrapper is open across SSE payloads.
#[derive(Default)]
struct DeltaDecoder {
    in_reasoning: bool,
}

impl DeltaDecoder {
    /// Translate one payload into zero or more text chunks. `None` means
    /// the stream signalled completion.
    fn decode(&mut self, data: &str) -> Option<Result<Vec<String>>> {
        if data == "[DONE]" {
            return None;
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return Some(Err(Error::Json(e))),
        };
        if let Some(message) = v.pointer("/error/message").and_then(Value::as_str) {
            return Some(Err(Error::Backend {
                backend: "loopback".into(),
                message: message.to_string(),
            }));
        }

        let choice = match v.pointer("/choices/0") {
            Some(c) => c,
            None => return Some(Ok(Vec::new())),
        };
        let mut out = Vec::new();
        let reasoning = choice
            .pointer("/delta/reasoning_content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        let content = choice
            .pointer("/delta/content")
            .or_else(|| choice.get("text"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());

        if let Some(r) = reasoning {
            if !self.in_reasoning {
                self.in_reasoning = true;
                out.push("<think>".to_string());
            }
            out.push(r.to_string());
        }
        if let Some(c) = content {
            if self.in_reasoning {
                self.in_reasoning = false;
                out.push("</think>".to_string());
            }
            out.push(c.to_string());
        }
        Some(Ok(out))
    }
}

pub struct LoopbackTokenSource {
    id: String,
    base_url: String,
    model: String,
    channel: Channel,
    client: reqwest::Client,
    current: Mutex<Option<CancellationToken>>,
}

impl LoopbackTokenSource {
    pub fn from_config(cfg: &LoopbackConfig, channel: Channel) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            id: format!("loopback:{}", cfg.model),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            channel,
            client,
            current: Mutex::new(None),
        })
    }

    fn request_body(&self, req: &GenerationRequest) -> (String, Value) {
        match &req.prompt {
            RenderedPrompt::Flat(prompt) => (
                format!("{}/completions", self.base_url),
                json!({
                    "model": self.model,
                    "prompt": prompt,
                    "stream": true,
                    "max_tokens": req.max_tokens,
                }),
            ),
            RenderedPrompt::Structured(entries) => (
                format!("{}/chat/completions", self.base_url),
                json!({
                    "model": self.model,
                    "messages": entries,
                    "stream": true,
                    "max_tokens": req.max_tokens,
                }),
            ),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for LoopbackTokenSource {
    async fn generate(&self, req: GenerationRequest) -> Result<TokenStream> {
        let token = CancellationToken::new();
        *self.current.lock() = Some(token.clone());

        let (url, body) = self.request_body(&req);
        tracing::debug!(source = %self.id, url = %url, "loopback stream request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Backend {
                backend: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let stream = async_stream::stream! {
            let mut resp = resp;
            let mut pending = Vec::new();
            let mut buffer = String::new();
            let mut decoder = DeltaDecoder::default();
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = resp.chunk() => next,
                };
                match next {
                    Ok(Some(bytes)) => {
                        pending.extend_from_slice(&bytes);
                        buffer.push_str(&take_utf8(&mut pending));
                        for data in take_sse_payloads(&mut buffer) {
                            match decoder.decode(&data) {
                                None => return,
                                Some(Ok(chunks)) => {
                                    for chunk in chunks {
                                        yield Ok(chunk);
                                    }
                                }
                                Some(Err(e)) => {
                                    yield Err(e);
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(from_reqwest(e));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    /// OpenAI-style streams are true deltas.
    fn chunk_mode(&self) -> ChunkMode {
        ChunkMode::Delta
    }

    fn source_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
