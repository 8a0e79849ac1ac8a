//! URL builders for the `/v1internal:{method}` colon-method surface.

pub fn v1internal(endpoint: &str, action: &str, sse: bool) -> String {
    if sse {
        format!("{}/v1internal:{}?alt=sse", endpoint, action)
    } else {
        format!("{}/v1internal:{}", endpoint, action)
    }
}

pub fn load_code_assist_url(endpoint: &str) -> String {
    v1internal(endpoint, "loadCodeAssist", false)
}

pub fn onboard_user_url(endpoint: &str) -> String {
    v1internal(endpoint, "onboardUser", false)
}

/// Extract `(model, action)` from a host-side generative URL of the shape
/// `.../models/{model}:{action}` (query string tolerated).
pub fn parse_model_action(url: &str) -> Option<(String, String)> {
    let path = url.split('?').next().unwrap_or(url);
    let rest = path.split("/models/").nth(1)?;
    let mut pieces = rest.splitn(2, ':');
    let model = pieces.next()?.trim();
    let action = pieces.next()?.trim();
    if model.is_empty() || action.is_empty() {
        return None;
    }
    Some((model.to_string(), action.to_string()))
}
