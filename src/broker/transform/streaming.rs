//! Line-oriented SSE transform: unwrap the upstream's `{"response": ...}`
//! envelope, rewrite thinking parts into the host's canonical shape, and
//! harvest thinking signatures into the cache as they stream past.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::broker::signature_cache::SignatureCache;
use crate::constants::MIN_SIGNATURE_LENGTH;

pub struct StreamOptions {
    pub session_key: String,
    pub keep_thinking: bool,
    pub debug: bool,
    pub model: String,
}

#[derive(Default)]
struct HarvestState {
    /// Accumulated thinking text per candidate index.
    thinking: HashMap<usize, String>,
    /// functionCall ids observed so far, attached to the last-thinking record.
    tool_ids: Vec<String>,
    debug_sent: bool,
}

pub fn transform_sse_stream(
    upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    cache: Arc<SignatureCache>,
    options: StreamOptions,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>> {
    use async_stream::stream;
    use futures::StreamExt;

    Box::pin(stream! {
        let mut upstream = upstream;
        let mut buffer = BytesMut::new();
        let mut state = HarvestState::default();

        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(format!("stream error: {}", e));
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);

            // Complete lines only; partial tails wait for the next chunk.
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line_raw = buffer.split_to(pos + 1);
                let Ok(line) = std::str::from_utf8(&line_raw) else {
                    continue;
                };
                for out in process_line(line.trim_end(), &mut state, &cache, &options) {
                    yield Ok(out);
                }
            }
        }

        // Flush a trailing line that arrived without a terminator.
        if !buffer.is_empty() {
            if let Ok(line) = std::str::from_utf8(&buffer) {
                for out in process_line(line.trim_end(), &mut state, &cache, &options) {
                    yield Ok(out);
                }
            }
        }
    })
}

fn process_line(
    line: &str,
    state: &mut HarvestState,
    cache: &SignatureCache,
    options: &StreamOptions,
) -> Vec<Bytes> {
    let Some(data) = line.strip_prefix("data:") else {
        // Non-data lines (comments, blank separators, event names) pass
        // through verbatim.
        if line.is_empty() {
            return vec![];
        }
        return vec![Bytes::from(format!("{}\n\n", line))];
    };

    let data = data.trim();
    if data.is_empty() {
        return vec![];
    }

    let Ok(parsed) = serde_json::from_str::<Value>(data) else {
        return vec![Bytes::from(format!("data: {}\n\n", data))];
    };

    let mut unwrapped = match parsed.get("response") {
        Some(inner) => inner.clone(),
        None => parsed,
    };

    harvest_signatures(&unwrapped, state, cache, options);
    rewrite_thinking_parts(&mut unwrapped);

    let mut out = Vec::new();
    if options.debug && !state.debug_sent {
        state.debug_sent = true;
        let blob = json!({
            "model": options.model,
            "session": options.session_key,
        });
        out.push(Bytes::from(format!(": antigravity-debug {}\n\n", blob)));
    }
    out.push(Bytes::from(format!("data: {}\n\n", unwrapped)));
    out
}

/// Accumulate thinking text per candidate and store the signature the moment
/// one appears. Partially-consumed streams still cache what they saw.
fn harvest_signatures(
    response: &Value,
    state: &mut HarvestState,
    cache: &SignatureCache,
    options: &StreamOptions,
) {
    if !options.keep_thinking {
        return;
    }
    let Some(candidates) = response.get("candidates").and_then(|v| v.as_array()) else {
        return;
    };

    for (candidate_idx, candidate) in candidates.iter().enumerate() {
        let index = candidate
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|i| i as usize)
            .unwrap_or(candidate_idx);
        let Some(parts) = candidate
            .pointer("/content/parts")
            .and_then(|v| v.as_array())
        else {
            continue;
        };

        for part in parts {
            if let Some(id) = part.pointer("/functionCall/id").and_then(|v| v.as_str()) {
                state.tool_ids.push(id.to_string());
            }

            let is_thought = part.get("thought").and_then(|v| v.as_bool()) == Some(true)
                || part.get("type").and_then(|v| v.as_str()) == Some("thinking");
            if is_thought {
                let text = part
                    .get("text")
                    .or_else(|| part.get("thinking"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                state.thinking.entry(index).or_default().push_str(text);
            }

            let signature = part
                .get("thoughtSignature")
                .or_else(|| part.get("signature"))
                .and_then(|v| v.as_str());
            if let Some(signature) = signature {
                if signature.len() >= MIN_SIGNATURE_LENGTH {
                    let accumulated = state.thinking.get(&index).cloned().unwrap_or_default();
                    cache.store(&options.session_key, &accumulated, signature);
                    cache.store_last(
                        &options.session_key,
                        &accumulated,
                        signature,
                        state.tool_ids.clone(),
                    );
                    tracing::debug!(
                        "[Streaming] harvested signature (candidate {}, {} chars of thinking)",
                        index,
                        accumulated.len()
                    );
                }
            }
        }
    }
}

/// Gemini thinking parts (`{thought: true, text}`) become the host's
/// `{type: "reasoning", text}`; Anthropic `{type: "thinking"}` blocks pass
/// through untouched.
fn rewrite_thinking_parts(response: &mut Value) {
    let Some(candidates) = response.get_mut("candidates").and_then(|v| v.as_array_mut()) else {
        return;
    };
    for candidate in candidates {
        let Some(parts) = candidate
            .pointer_mut("/content/parts")
            .and_then(|v| v.as_array_mut())
        else {
            continue;
        };
        for part in parts {
            if part.get("thought").and_then(|v| v.as_bool()) != Some(true) {
                continue;
            }
            let text = part
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let signature = part
                .get("thoughtSignature")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let mut rewritten = json!({"type": "reasoning", "text": text});
            if let Some(signature) = signature {
                rewritten["thoughtSignature"] = json!(signature);
            }
            *part = rewritten;
        }
    }
}
