//! Conversation repair: tool-id pairing, thinking-signature backfill and the
//! destructive crash-and-restart rewrite for corrupted tool loops.
//!
//! Two wire shapes flow through here. The Gemini wire uses `contents[]` with
//! `functionCall`/`functionResponse` parts and `{text, thought: true}`
//! thinking parts; the Claude messages wire uses `messages[]` with
//! `tool_use`/`tool_result`/`thinking` content blocks. Every pass handles
//! whichever shape the body carries.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::broker::signature_cache::SignatureCache;
use crate::constants::MIN_SIGNATURE_LENGTH;

const CANCELLED_RESULT: &str = "Operation cancelled or missing";
const TURN_CLOSE_TEXT: &str = "[Tool execution completed. Proceeding to final response.]";

#[derive(Debug, Default, PartialEq)]
pub struct ConversationState {
    /// The conversation ends on a tool result, i.e. the model owes a reply.
    pub in_tool_loop: bool,
    /// First assistant message of the current turn.
    pub turn_start_idx: Option<usize>,
    /// That turn already carries a signed thinking block.
    pub turn_has_thinking: bool,
}

fn message_list<'a>(request: &'a Value) -> Option<(&'static str, &'a Vec<Value>)> {
    if let Some(contents) = request.get("contents").and_then(|v| v.as_array()) {
        return Some(("contents", contents));
    }
    if let Some(messages) = request.get("messages").and_then(|v| v.as_array()) {
        return Some(("messages", messages));
    }
    None
}

fn message_list_mut<'a>(
    request: &'a mut Value,
) -> Option<(&'static str, &'a mut Vec<Value>)> {
    if request.get("contents").is_some() {
        return request
            .get_mut("contents")
            .and_then(|v| v.as_array_mut())
            .map(|list| ("contents", list));
    }
    if request.get("messages").is_some() {
        return request
            .get_mut("messages")
            .and_then(|v| v.as_array_mut())
            .map(|list| ("messages", list));
    }
    None
}

fn is_assistant_role(message: &Value) -> bool {
    matches!(
        message.get("role").and_then(|v| v.as_str()),
        Some("model") | Some("assistant")
    )
}

fn is_user_role(message: &Value) -> bool {
    message.get("role").and_then(|v| v.as_str()) == Some("user")
}

fn blocks_of(message: &Value) -> Vec<&Value> {
    for key in ["parts", "content"] {
        if let Some(list) = message.get(key).and_then(|v| v.as_array()) {
            return list.iter().collect();
        }
    }
    Vec::new()
}

fn is_tool_result_block(block: &Value) -> bool {
    block.get("functionResponse").is_some()
        || block.get("type").and_then(|v| v.as_str()) == Some("tool_result")
}

fn is_tool_use_block(block: &Value) -> bool {
    block.get("functionCall").is_some()
        || block.get("type").and_then(|v| v.as_str()) == Some("tool_use")
}

fn is_thinking_block(block: &Value) -> bool {
    block.get("thought").and_then(|v| v.as_bool()) == Some(true)
        || block.get("type").and_then(|v| v.as_str()) == Some("thinking")
}

fn thinking_text(block: &Value) -> Option<&str> {
    if block.get("thought").and_then(|v| v.as_bool()) == Some(true) {
        return block.get("text").and_then(|v| v.as_str());
    }
    if block.get("type").and_then(|v| v.as_str()) == Some("thinking") {
        return block.get("thinking").and_then(|v| v.as_str());
    }
    None
}

fn thinking_signature(block: &Value) -> Option<&str> {
    block
        .get("thoughtSignature")
        .or_else(|| block.get("signature"))
        .and_then(|v| v.as_str())
}

fn is_signed_thinking(block: &Value) -> bool {
    is_thinking_block(block)
        && thinking_signature(block).is_some_and(|s| s.len() >= MIN_SIGNATURE_LENGTH)
}

/// A user message is synthetic when it carries nothing but tool results.
fn is_synthetic_user(message: &Value) -> bool {
    let blocks = blocks_of(message);
    !blocks.is_empty() && blocks.iter().all(|b| is_tool_result_block(b))
}

pub fn analyze_conversation(request: &Value) -> ConversationState {
    let mut state = ConversationState::default();
    let Some((_, messages)) = message_list(request) else {
        return state;
    };
    if messages.is_empty() {
        return state;
    }

    if let Some(last) = messages.last() {
        state.in_tool_loop = blocks_of(last).iter().any(|b| is_tool_result_block(b));
    }

    // The current turn starts at the first assistant message after the last
    // real (non-synthetic) user message.
    let last_real_user = messages
        .iter()
        .enumerate()
        .rev()
        .find(|(_, m)| is_user_role(m) && !is_synthetic_user(m))
        .map(|(i, _)| i);
    let search_from = last_real_user.map(|i| i + 1).unwrap_or(0);
    state.turn_start_idx = messages
        .iter()
        .enumerate()
        .skip(search_from)
        .find(|(_, m)| is_assistant_role(m))
        .map(|(i, _)| i);

    if let Some(turn_start) = state.turn_start_idx {
        state.turn_has_thinking = messages[turn_start..]
            .iter()
            .filter(|m| is_assistant_role(m))
            .any(|m| blocks_of(m).iter().any(|b| is_signed_thinking(b)));
    }

    state
}

/// Signature backfill for Claude thinking conversations.
///
/// Three passes in one walk: re-attach cached signatures to thinking blocks
/// the host stripped them from, prepend the cached "last thinking" to
/// assistant tool-use messages that lost their thinking entirely, and
/// finally drop any thinking block that is still unsigned (the upstream
/// rejects those outright).
pub fn backfill_signatures(request: &mut Value, session_key: &str, cache: &SignatureCache) {
    let last_thinking = cache.get_last(session_key);
    let Some((shape, messages)) = message_list_mut(request) else {
        return;
    };
    let gemini_wire = shape == "contents";

    let mut attached = 0usize;
    let mut prepended = 0usize;
    let mut stripped = 0usize;

    for message in messages.iter_mut() {
        if !is_assistant_role(message) {
            continue;
        }
        let Some(blocks) = message
            .get_mut(if gemini_wire { "parts" } else { "content" })
            .and_then(|v| v.as_array_mut())
        else {
            continue;
        };

        // Attach cached signatures to unsigned thinking blocks.
        for block in blocks.iter_mut() {
            if !is_thinking_block(block) || is_signed_thinking(block) {
                continue;
            }
            let Some(text) = thinking_text(block).map(str::to_string) else {
                continue;
            };
            if let Some(signature) = cache.get(session_key, &text) {
                let field = if gemini_wire {
                    "thoughtSignature"
                } else {
                    "signature"
                };
                block[field] = json!(signature);
                attached += 1;
            }
        }

        // A tool-use message must lead with signed thinking.
        let has_tool_use = blocks.iter().any(|b| is_tool_use_block(b));
        let has_signed = blocks.iter().any(|b| is_signed_thinking(b));
        if has_tool_use && !has_signed {
            if let Some(last) = &last_thinking {
                let synthetic = if gemini_wire {
                    json!({
                        "text": last.thinking_text.clone().unwrap_or_default(),
                        "thought": true,
                        "thoughtSignature": last.signature,
                    })
                } else {
                    json!({
                        "type": "thinking",
                        "thinking": last.thinking_text.clone().unwrap_or_default(),
                        "signature": last.signature,
                    })
                };
                blocks.insert(0, synthetic);
                prepended += 1;
            }
        }

        // Unsigned thinking cannot be sent.
        blocks.retain(|block| {
            if is_thinking_block(block) && !is_signed_thinking(block) {
                stripped += 1;
                false
            } else {
                true
            }
        });
    }

    if attached + prepended + stripped > 0 {
        tracing::info!(
            "[Thinking-Backfill] attached {} signature(s), prepended {}, stripped {} unsigned",
            attached,
            prepended,
            stripped
        );
    }
}

struct CallSite {
    message_idx: usize,
    id: String,
    name: String,
}

/// Tool-id pairing for the Gemini wire, two passes plus orphan recovery.
///
/// Pass 1 gives every `functionCall` an id (synthetic `tool-call-N` when
/// missing) and queues ids per function name; pass 2 pops those queues into
/// `functionResponse`s that arrived without one. Orphan recovery then
/// matches by exact id (A), by name (B), by position (C), and finally
/// synthesizes a cancelled-result response for every call still unanswered
/// (D) so the conversation parses.
pub fn pair_function_call_ids(request: &mut Value, orphan_recovery: bool) {
    let Some(messages) = request.get_mut("contents").and_then(|v| v.as_array_mut()) else {
        return;
    };

    let mut next_id = 0usize;
    let mut queues: HashMap<String, VecDeque<String>> = HashMap::new();

    // Pass 1: assign ids to calls.
    for message in messages.iter_mut() {
        let Some(parts) = message.get_mut("parts").and_then(|v| v.as_array_mut()) else {
            continue;
        };
        for part in parts.iter_mut() {
            let Some(call) = part.get_mut("functionCall") else {
                continue;
            };
            let name = call
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let id = match call.get("id").and_then(|v| v.as_str()) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    let id = format!("tool-call-{}", next_id);
                    next_id += 1;
                    call["id"] = json!(id);
                    id
                }
            };
            queues.entry(name).or_default().push_back(id);
        }
    }

    // Pass 2: pop ids into responses that lack one.
    for message in messages.iter_mut() {
        let Some(parts) = message.get_mut("parts").and_then(|v| v.as_array_mut()) else {
            continue;
        };
        for part in parts.iter_mut() {
            let Some(response) = part.get_mut("functionResponse") else {
                continue;
            };
            let has_id = response
                .get("id")
                .and_then(|v| v.as_str())
                .is_some_and(|id| !id.is_empty());
            if has_id {
                continue;
            }
            let name = response
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if let Some(id) = queues.get_mut(&name).and_then(|q| q.pop_front()) {
                response["id"] = json!(id);
            }
        }
    }

    if !orphan_recovery {
        return;
    }

    // Inventory for the orphan passes.
    let mut calls: Vec<CallSite> = Vec::new();
    let mut responses: Vec<(usize, usize, String, String)> = Vec::new(); // (msg, part, id, name)
    for (message_idx, message) in messages.iter().enumerate() {
        for (part_idx, part) in blocks_of(message).iter().enumerate() {
            if let Some(call) = part.get("functionCall") {
                calls.push(CallSite {
                    message_idx,
                    id: call.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    name: call
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                });
            } else if let Some(response) = part.get("functionResponse") {
                responses.push((
                    message_idx,
                    part_idx,
                    response
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    response
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                ));
            }
        }
    }

    // Pass A: exact id matches.
    let mut matched_calls: HashSet<usize> = HashSet::new();
    let mut matched_responses: HashSet<usize> = HashSet::new();
    for (r_idx, (_, _, response_id, _)) in responses.iter().enumerate() {
        if response_id.is_empty() {
            continue;
        }
        if let Some(c_idx) = calls
            .iter()
            .enumerate()
            .find(|(c_idx, call)| !matched_calls.contains(c_idx) && call.id == *response_id)
            .map(|(c_idx, _)| c_idx)
        {
            matched_calls.insert(c_idx);
            matched_responses.insert(r_idx);
        }
    }

    // Pass B: ids drifted; rebind by function name.
    let mut rewrites: Vec<(usize, usize, String)> = Vec::new(); // (msg, part, new id)
    for (r_idx, (msg, part, _, name)) in responses.iter().enumerate() {
        if matched_responses.contains(&r_idx) {
            continue;
        }
        if let Some(c_idx) = calls
            .iter()
            .enumerate()
            .find(|(c_idx, call)| !matched_calls.contains(c_idx) && call.name == *name)
            .map(|(c_idx, _)| c_idx)
        {
            rewrites.push((*msg, *part, calls[c_idx].id.clone()));
            matched_calls.insert(c_idx);
            matched_responses.insert(r_idx);
        }
    }

    // Pass C: anything left pairs positionally.
    for (r_idx, (msg, part, _, _)) in responses.iter().enumerate() {
        if matched_responses.contains(&r_idx) {
            continue;
        }
        if let Some(c_idx) = (0..calls.len()).find(|c_idx| !matched_calls.contains(c_idx)) {
            rewrites.push((*msg, *part, calls[c_idx].id.clone()));
            matched_calls.insert(c_idx);
            matched_responses.insert(r_idx);
        }
    }

    for (msg, part, id) in rewrites {
        if let Some(response) = messages[msg]["parts"][part].get_mut("functionResponse") {
            tracing::debug!("[Tool-Pairing] rebinding response at {}/{} to {}", msg, part, id);
            response["id"] = json!(id);
        }
    }

    // Pass D: synthesize a response for every call still unanswered.
    let unmatched: Vec<(usize, String, String)> = calls
        .iter()
        .enumerate()
        .filter(|(c_idx, _)| !matched_calls.contains(c_idx))
        .map(|(_, call)| (call.message_idx, call.id.clone(), call.name.clone()))
        .collect();
    if unmatched.is_empty() {
        return;
    }
    tracing::warn!(
        "[Tool-Pairing] synthesizing {} cancelled result(s) for unanswered call(s)",
        unmatched.len()
    );

    // Group by the message holding the call; insert into the following user
    // message, or create one right after the call.
    let mut by_message: HashMap<usize, Vec<Value>> = HashMap::new();
    for (message_idx, id, name) in unmatched {
        by_message.entry(message_idx).or_default().push(json!({
            "functionResponse": {
                "name": name,
                "response": {"result": CANCELLED_RESULT},
                "id": id,
            }
        }));
    }
    let mut insertions: Vec<(usize, Vec<Value>)> = by_message.into_iter().collect();
    insertions.sort_by(|a, b| b.0.cmp(&a.0)); // back to front keeps indices valid
    for (message_idx, parts) in insertions {
        let next_is_user = messages
            .get(message_idx + 1)
            .map(|m| is_user_role(m))
            .unwrap_or(false);
        if next_is_user {
            if let Some(existing) = messages[message_idx + 1]
                .get_mut("parts")
                .and_then(|v| v.as_array_mut())
            {
                for (offset, part) in parts.into_iter().enumerate() {
                    existing.insert(offset, part);
                }
                continue;
            }
        }
        messages.insert(message_idx + 1, json!({"role": "user", "parts": parts}));
    }
}

/// Messages-format analogue for Claude `tool_use`/`tool_result` blocks, with
/// a nuclear fallback that drops orphan tool blocks when pairing cannot be
/// restored.
pub fn pair_claude_tool_blocks(request: &mut Value, orphan_recovery: bool) {
    let Some(messages) = request.get_mut("messages").and_then(|v| v.as_array_mut()) else {
        return;
    };

    let mut next_id = 0usize;
    let mut queues: HashMap<String, VecDeque<String>> = HashMap::new();
    let mut id_to_name: HashMap<String, String> = HashMap::new();

    for message in messages.iter_mut() {
        let Some(blocks) = message.get_mut("content").and_then(|v| v.as_array_mut()) else {
            continue;
        };
        for block in blocks.iter_mut() {
            if block.get("type").and_then(|v| v.as_str()) != Some("tool_use") {
                continue;
            }
            let name = block
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let id = match block.get("id").and_then(|v| v.as_str()) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    let id = format!("tool-call-{}", next_id);
                    next_id += 1;
                    block["id"] = json!(id);
                    id
                }
            };
            id_to_name.insert(id.clone(), name.clone());
            queues.entry(name).or_default().push_back(id);
        }
    }

    for message in messages.iter_mut() {
        let Some(blocks) = message.get_mut("content").and_then(|v| v.as_array_mut()) else {
            continue;
        };
        for block in blocks.iter_mut() {
            if block.get("type").and_then(|v| v.as_str()) != Some("tool_result") {
                continue;
            }
            let has_id = block
                .get("tool_use_id")
                .and_then(|v| v.as_str())
                .is_some_and(|id| !id.is_empty());
            if has_id {
                continue;
            }
            let name = block
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if let Some(id) = queues.get_mut(&name).and_then(|q| q.pop_front()) {
                block["tool_use_id"] = json!(id);
            }
        }
    }

    // Collect pairing state.
    let mut use_ids: Vec<String> = Vec::new();
    let mut result_ids: HashSet<String> = HashSet::new();
    for message in messages.iter() {
        for block in blocks_of(message) {
            match block.get("type").and_then(|v| v.as_str()) {
                Some("tool_use") => {
                    if let Some(id) = block.get("id").and_then(|v| v.as_str()) {
                        use_ids.push(id.to_string());
                    }
                }
                Some("tool_result") => {
                    if let Some(id) = block.get("tool_use_id").and_then(|v| v.as_str()) {
                        result_ids.insert(id.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    let missing: Vec<String> = use_ids
        .iter()
        .filter(|id| !result_ids.contains(*id))
        .cloned()
        .collect();

    if orphan_recovery && !missing.is_empty() {
        // Synthesize cancelled results at the front of the next user message.
        let mut pending: Vec<Value> = missing
            .iter()
            .map(|id| {
                json!({
                    "type": "tool_result",
                    "tool_use_id": id,
                    "content": CANCELLED_RESULT,
                })
            })
            .collect();
        let insert_at = messages
            .iter()
            .rposition(|m| {
                is_assistant_role(m) && blocks_of(m).iter().any(|b| is_tool_use_block(b))
            })
            .map(|i| i + 1);
        match insert_at {
            Some(i) if i < messages.len() && is_user_role(&messages[i]) => {
                if let Some(blocks) = messages[i].get_mut("content").and_then(|v| v.as_array_mut())
                {
                    for (offset, block) in pending.drain(..).enumerate() {
                        blocks.insert(offset, block);
                    }
                }
            }
            Some(i) => {
                messages.insert(i, json!({"role": "user", "content": pending}));
            }
            None => {}
        }
        for id in &missing {
            result_ids.insert(id.clone());
        }
        tracing::warn!(
            "[Tool-Pairing] injected {} synthetic tool_result block(s)",
            missing.len()
        );
    }

    // Basic invariants after pairing: every result points at a known use and
    // every use has a result. Anything still broken gets the nuclear pass:
    // drop the orphan tool blocks entirely so the conversation parses.
    let known_uses: HashSet<String> = use_ids.iter().cloned().collect();
    let orphan_results: Vec<String> = result_ids
        .iter()
        .filter(|id| !known_uses.contains(*id))
        .cloned()
        .collect();
    let still_missing: HashSet<String> = use_ids
        .into_iter()
        .filter(|id| !result_ids.contains(id))
        .collect();
    if orphan_results.is_empty() && still_missing.is_empty() {
        return;
    }

    tracing::warn!(
        "[Tool-Pairing] nuclear cleanup: dropping {} orphan tool block(s)",
        orphan_results.len() + still_missing.len()
    );
    for message in messages.iter_mut() {
        let Some(blocks) = message.get_mut("content").and_then(|v| v.as_array_mut()) else {
            continue;
        };
        blocks.retain(|block| match block.get("type").and_then(|v| v.as_str()) {
            Some("tool_use") => block
                .get("id")
                .and_then(|v| v.as_str())
                .map(|id| !still_missing.contains(id))
                .unwrap_or(false),
            Some("tool_result") => block
                .get("tool_use_id")
                .and_then(|v| v.as_str())
                .map(|id| known_uses.contains(id))
                .unwrap_or(false),
            _ => true,
        });
    }
    messages
        .retain(|m| !blocks_of(m).is_empty() || m.get("content").and_then(|c| c.as_str()).is_some());
}

/// Strip every thinking block from both wire shapes.
pub fn strip_all_thinking(request: &mut Value) {
    let Some((_, messages)) = message_list_mut(request) else {
        return;
    };
    for message in messages.iter_mut() {
        for key in ["parts", "content"] {
            if let Some(blocks) = message.get_mut(key).and_then(|v| v.as_array_mut()) {
                blocks.retain(|block| !is_thinking_block(block));
            }
        }
    }
}

/// Crash-and-restart: when the model owes a tool-loop reply but the turn has
/// no signed thinking and nothing cached can restore one, gentler repairs
/// cannot produce a body the upstream accepts. Give up on the turn: drop all
/// thinking, close the turn with a synthetic assistant message, open a fresh
/// one with the continuation prompt, and forget the session's last thinking.
pub fn apply_crash_restart(
    request: &mut Value,
    session_key: &str,
    cache: &SignatureCache,
    resume_text: &str,
) {
    strip_all_thinking(request);

    let Some((shape, messages)) = message_list_mut(request) else {
        return;
    };
    let gemini_wire = shape == "contents";
    let (assistant_role, content_key) = if gemini_wire {
        ("model", "parts")
    } else {
        ("assistant", "content")
    };

    messages.push(json!({
        "role": assistant_role,
        content_key: [{"text": TURN_CLOSE_TEXT}],
    }));
    messages.push(json!({
        "role": "user",
        content_key: [{"text": resume_text}],
    }));

    cache.clear_last(session_key);
    tracing::warn!(
        "[Thinking-Recovery] crash-and-restart applied for session {}",
        session_key
    );
}

/// True when the conversation is inside a tool loop whose current turn has
/// no signed thinking. Run after `backfill_signatures` so the cached last
/// thinking has had its chance first.
pub fn needs_thinking_recovery(request: &Value) -> bool {
    let state = analyze_conversation(request);
    state.in_tool_loop && !state.turn_has_thinking
}

/// A Claude thinking request that carries tool definitions but has no signed
/// thinking anywhere (history or cache) will be rejected on its first tool
/// call; a minimal warmup request elicits a signature first.
pub fn needs_signed_thinking_warmup(
    request: &Value,
    session_key: &str,
    cache: &SignatureCache,
) -> bool {
    let has_tools = request
        .get("tools")
        .and_then(|v| v.as_array())
        .is_some_and(|tools| !tools.is_empty());
    if !has_tools {
        return false;
    }
    if cache.get_last(session_key).is_some() {
        return false;
    }
    let Some((_, messages)) = message_list(request) else {
        return true;
    };
    !messages
        .iter()
        .any(|m| blocks_of(m).iter().any(|b| is_signed_thinking(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignatureCacheConfig;

    fn cache(tag: &str) -> SignatureCache {
        let dir = std::env::temp_dir().join(format!(
            ".antigravity-repair-{}-{}",
            std::process::id(),
            tag
        ));
        let _ = std::fs::create_dir_all(&dir);
        let _ = std::fs::remove_file(dir.join(crate::constants::SIGNATURE_CACHE_FILE));
        SignatureCache::new(SignatureCacheConfig::default(), dir)
    }

    fn sig() -> String {
        "g".repeat(64)
    }

    #[test]
    fn fifo_assignment_and_cancelled_placeholder() {
        // Two calls to the same function, one id-less response: the response
        // takes the first queued id, the second call gets a placeholder.
        let mut request = json!({
            "contents": [
                {"role": "model", "parts": [{"functionCall": {"name": "read_file", "args": {}, "id": "a"}}]},
                {"role": "model", "parts": [{"functionCall": {"name": "read_file", "args": {}, "id": "b"}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "read_file", "response": {"result": "data"}}}]}
            ]
        });
        pair_function_call_ids(&mut request, true);

        let contents = request["contents"].as_array().unwrap();
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["id"],
            json!("a")
        );
        // Pass D synthesized a response for call "b".
        let all = contents
            .iter()
            .flat_map(|m| m["parts"].as_array().unwrap().iter())
            .filter_map(|p| p.get("functionResponse"))
            .collect::<Vec<_>>();
        assert_eq!(all.len(), 2);
        let placeholder = all
            .iter()
            .find(|r| r["id"] == json!("b"))
            .expect("synthesized response");
        assert_eq!(placeholder["response"]["result"], json!(CANCELLED_RESULT));
    }

    #[test]
    fn missing_call_ids_get_synthetic_ones() {
        let mut request = json!({
            "contents": [
                {"role": "model", "parts": [{"functionCall": {"name": "run", "args": {}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "run", "response": {"result": "ok"}}}]}
            ]
        });
        pair_function_call_ids(&mut request, true);
        let call_id = request["contents"][0]["parts"][0]["functionCall"]["id"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(call_id.starts_with("tool-call-"));
        assert_eq!(
            request["contents"][1]["parts"][0]["functionResponse"]["id"]
                .as_str()
                .unwrap(),
            call_id
        );
    }

    #[test]
    fn drifted_ids_rebind_by_name_then_position() {
        let mut request = json!({
            "contents": [
                {"role": "model", "parts": [
                    {"functionCall": {"name": "alpha", "args": {}, "id": "call-1"}},
                    {"functionCall": {"name": "beta", "args": {}, "id": "call-2"}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "alpha", "response": {"result": "r1"}, "id": "stale-9"}},
                    {"functionResponse": {"name": "gamma", "response": {"result": "r2"}, "id": "stale-8"}}
                ]}
            ]
        });
        pair_function_call_ids(&mut request, true);
        let parts = request["contents"][1]["parts"].as_array().unwrap();
        // alpha rebinds by name, gamma takes the remaining call by position.
        assert_eq!(parts[0]["functionResponse"]["id"], json!("call-1"));
        assert_eq!(parts[1]["functionResponse"]["id"], json!("call-2"));
    }

    #[test]
    fn pairing_invariant_holds_after_repair() {
        let mut request = json!({
            "contents": [
                {"role": "model", "parts": [
                    {"functionCall": {"name": "a", "args": {}}},
                    {"functionCall": {"name": "b", "args": {}}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "b", "response": {"result": "rb"}}}
                ]},
                {"role": "model", "parts": [{"functionCall": {"name": "c", "args": {}}}]}
            ]
        });
        pair_function_call_ids(&mut request, true);

        let mut call_ids = Vec::new();
        let mut response_ids = Vec::new();
        for message in request["contents"].as_array().unwrap() {
            for part in message["parts"].as_array().unwrap() {
                if let Some(call) = part.get("functionCall") {
                    call_ids.push(call["id"].as_str().unwrap().to_string());
                }
                if let Some(response) = part.get("functionResponse") {
                    let id = response["id"].as_str().unwrap();
                    assert!(!id.is_empty());
                    response_ids.push(id.to_string());
                }
            }
        }
        for id in &call_ids {
            assert!(response_ids.contains(id), "call {} has no response", id);
        }
    }

    #[test]
    fn claude_blocks_pair_and_synthesize() {
        let mut request = json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu-1", "name": "read", "input": {}},
                    {"type": "tool_use", "id": "tu-2", "name": "read", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "content": "data", "name": "read"}
                ]}
            ]
        });
        pair_claude_tool_blocks(&mut request, true);
        let user_blocks = request["messages"][1]["content"].as_array().unwrap();
        // Synthetic result for tu-2 landed in front, original got tu-1.
        assert!(user_blocks
            .iter()
            .any(|b| b["tool_use_id"] == json!("tu-1") && b["content"] == json!("data")));
        assert!(user_blocks
            .iter()
            .any(|b| b["tool_use_id"] == json!("tu-2")
                && b["content"] == json!(CANCELLED_RESULT)));
    }

    #[test]
    fn nuclear_pass_drops_orphan_blocks() {
        let mut request = json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu-1", "name": "read", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "unknown-1", "content": "stale"},
                    {"type": "text", "text": "keep me"}
                ]}
            ]
        });
        pair_claude_tool_blocks(&mut request, false);
        let messages = request["messages"].as_array().unwrap();
        // Orphan result and unanswered use are both gone; text survives.
        assert!(messages.iter().all(|m| blocks_of(m)
            .iter()
            .all(|b| !is_tool_use_block(b) && !is_tool_result_block(b))));
        assert!(request.to_string().contains("keep me"));
    }

    #[test]
    fn backfill_attaches_cached_signature() {
        let cache = cache("attach");
        let signature = sig();
        cache.store("sess-1", "pondering the file", &signature);

        let mut request = json!({
            "contents": [
                {"role": "model", "parts": [
                    {"text": "pondering the file", "thought": true},
                    {"functionCall": {"name": "read", "args": {}, "id": "c1"}}
                ]}
            ]
        });
        backfill_signatures(&mut request, "sess-1", &cache);
        assert_eq!(
            request["contents"][0]["parts"][0]["thoughtSignature"],
            json!(signature)
        );
    }

    #[test]
    fn backfill_prepends_last_thinking_for_bare_tool_use() {
        let cache = cache("prepend");
        let signature = sig();
        cache.store_last("sess-1", "earlier thought", &signature, vec![]);

        let mut request = json!({
            "contents": [
                {"role": "model", "parts": [
                    {"functionCall": {"name": "read", "args": {}, "id": "c1"}}
                ]}
            ]
        });
        backfill_signatures(&mut request, "sess-1", &cache);
        let parts = request["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["thought"], json!(true));
        assert_eq!(parts[0]["text"], json!("earlier thought"));
        assert_eq!(parts[0]["thoughtSignature"], json!(signature));
    }

    #[test]
    fn backfill_strips_unsigned_thinking() {
        let cache = cache("strip");
        let mut request = json!({
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "no signature for this"},
                    {"type": "text", "text": "answer"}
                ]}
            ]
        });
        backfill_signatures(&mut request, "sess-none", &cache);
        let blocks = request["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["type"], json!("text"));
    }

    #[test]
    fn no_unsigned_thinking_survives_backfill() {
        let cache = cache("invariant");
        let signature = sig();
        cache.store("sess-1", "known text", &signature);
        let mut request = json!({
            "contents": [
                {"role": "model", "parts": [
                    {"text": "known text", "thought": true},
                    {"text": "unknown text", "thought": true},
                    {"text": "visible answer"}
                ]}
            ]
        });
        backfill_signatures(&mut request, "sess-1", &cache);
        for message in request["contents"].as_array().unwrap() {
            for part in message["parts"].as_array().unwrap() {
                if is_thinking_block(part) {
                    assert!(is_signed_thinking(part));
                }
            }
        }
    }

    #[test]
    fn analyze_detects_tool_loop_and_turn_thinking() {
        let signed = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "do the thing"}]},
                {"role": "model", "parts": [
                    {"text": "planning", "thought": true, "thoughtSignature": sig()},
                    {"functionCall": {"name": "run", "args": {}, "id": "c1"}}
                ]},
                {"role": "user", "parts": [{"functionResponse": {"name": "run", "response": {}, "id": "c1"}}]}
            ]
        });
        let state = analyze_conversation(&signed);
        assert!(state.in_tool_loop);
        assert_eq!(state.turn_start_idx, Some(1));
        assert!(state.turn_has_thinking);
        assert!(!needs_thinking_recovery(&signed));

        let unsigned = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "do the thing"}]},
                {"role": "model", "parts": [
                    {"functionCall": {"name": "run", "args": {}, "id": "c1"}}
                ]},
                {"role": "user", "parts": [{"functionResponse": {"name": "run", "response": {}, "id": "c1"}}]}
            ]
        });
        assert!(needs_thinking_recovery(&unsigned));
    }

    #[test]
    fn crash_restart_strips_thinking_and_closes_turn() {
        let cache = cache("restart");
        cache.store_last("sess-9", "stale", &sig(), vec![]);
        let mut request = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "task"}]},
                {"role": "model", "parts": [
                    {"text": "half a thought", "thought": true},
                    {"functionCall": {"name": "run", "args": {}, "id": "c1"}}
                ]},
                {"role": "user", "parts": [{"functionResponse": {"name": "run", "response": {}, "id": "c1"}}]}
            ]
        });
        apply_crash_restart(&mut request, "sess-9", &cache, "continue");

        let contents = request["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 5);
        // Zero thinking blocks anywhere.
        for message in contents {
            for part in message["parts"].as_array().unwrap() {
                assert!(!is_thinking_block(part));
            }
        }
        let closer = &contents[3];
        assert_eq!(closer["role"], json!("model"));
        let opener = &contents[4];
        assert_eq!(opener["role"], json!("user"));
        assert_eq!(opener["parts"][0]["text"], json!("continue"));
        // Cached last thinking is gone.
        assert!(cache.get_last("sess-9").is_none());
    }

    #[test]
    fn warmup_needed_only_without_any_signature_source() {
        let cache = cache("warmup");
        let with_tools = json!({
            "tools": [{"functionDeclarations": [{"name": "run"}]}],
            "contents": [{"role": "user", "parts": [{"text": "go"}]}]
        });
        assert!(needs_signed_thinking_warmup(&with_tools, "sess-w", &cache));

        // A cached last thinking suppresses the warmup.
        cache.store_last("sess-w", "warm", &sig(), vec![]);
        assert!(!needs_signed_thinking_warmup(&with_tools, "sess-w", &cache));

        // Signed thinking in history also suppresses it.
        let with_history = json!({
            "tools": [{"functionDeclarations": [{"name": "run"}]}],
            "contents": [
                {"role": "model", "parts": [{"text": "t", "thought": true, "thoughtSignature": sig()}]}
            ]
        });
        assert!(!needs_signed_thinking_warmup(&with_history, "sess-x", &cache));

        // No tools, no warmup.
        let toolless = json!({"contents": []});
        assert!(!needs_signed_thinking_warmup(&toolless, "sess-y", &cache));
    }

    #[test]
    fn synthetic_user_messages_do_not_reset_the_turn() {
        let body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "real ask"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "a", "args": {}, "id": "1"}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "a", "response": {}, "id": "1"}}]},
                {"role": "model", "parts": [{"functionCall": {"name": "b", "args": {}, "id": "2"}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "b", "response": {}, "id": "2"}}]}
            ]
        });
        let state = analyze_conversation(&body);
        // Turn starts at the first model message after the real user ask.
        assert_eq!(state.turn_start_idx, Some(1));
        assert!(state.in_tool_loop);
    }
}
