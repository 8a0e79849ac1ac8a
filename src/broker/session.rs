use serde_json::Value;
use sha2::{Digest, Sha256};

/// Builds the composite cache key that ties signature-cache entries to one
/// conversation: `{plugin uuid}:{lowercased model}:{project}:{conversation}`.
///
/// The plugin uuid is stable for the process lifetime and owned by the
/// dispatcher, so two hosts sharing a config directory never collide.
pub struct SessionKeyBuilder {
    plugin_uuid: String,
}

impl SessionKeyBuilder {
    pub fn new() -> Self {
        Self {
            plugin_uuid: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_uuid(plugin_uuid: &str) -> Self {
        Self {
            plugin_uuid: plugin_uuid.to_string(),
        }
    }

    pub fn build(&self, model: &str, project: &str, body: &Value) -> String {
        format!(
            "{}:{}:{}:{}",
            self.plugin_uuid,
            model.to_ascii_lowercase(),
            project,
            conversation_key(body)
        )
    }
}

impl Default for SessionKeyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

const ID_FIELDS: [&str; 6] = [
    "conversationId",
    "conversation_id",
    "threadId",
    "thread_id",
    "sessionId",
    "session_id",
];

/// Stable per-conversation discriminator without any server-issued id:
/// a client-supplied conversation/thread/session id when present, else a
/// fingerprint of the system instruction and first user message, else
/// `default`.
pub fn conversation_key(body: &Value) -> String {
    for scope in [Some(body), body.get("request"), body.get("metadata")] {
        let Some(scope) = scope else { continue };
        for field in ID_FIELDS {
            if let Some(id) = scope.get(field).and_then(|v| v.as_str()) {
                if !id.trim().is_empty() {
                    return id.trim().to_string();
                }
            }
        }
    }

    let system = system_instruction_text(body);
    let first_user = first_user_text(body);
    if system.is_empty() && first_user.is_empty() {
        return "default".to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(system.as_bytes());
    hasher.update(b"|");
    hasher.update(first_user.as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

fn system_instruction_text(body: &Value) -> String {
    let root = body.get("request").unwrap_or(body);
    let instruction = root
        .get("systemInstruction")
        .or_else(|| root.get("system_instruction"))
        .or_else(|| root.get("system"));
    let Some(instruction) = instruction else {
        return String::new();
    };
    match instruction {
        Value::String(text) => text.clone(),
        other => collect_text_parts(other),
    }
}

fn first_user_text(body: &Value) -> String {
    let root = body.get("request").unwrap_or(body);
    for list_name in ["contents", "messages"] {
        let Some(list) = root.get(list_name).and_then(|v| v.as_array()) else {
            continue;
        };
        for message in list {
            if message.get("role").and_then(|v| v.as_str()) != Some("user") {
                continue;
            }
            let text = collect_text_parts(message);
            if !text.is_empty() {
                return text;
            }
        }
    }
    String::new()
}

fn collect_text_parts(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(collect_text_parts)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(obj) => {
            if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
                return text.to_string();
            }
            for inner in ["parts", "content"] {
                if let Some(value) = obj.get(inner) {
                    let text = collect_text_parts(value);
                    if !text.is_empty() {
                        return text;
                    }
                }
            }
            String::new()
        }
        _ => String::new(),
    }
}
