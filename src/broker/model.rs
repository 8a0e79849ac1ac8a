//! Requested-model parsing: alias table, tier suffix and thinking defaults.

/// What the rest of the pipeline needs to know about a requested model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub requested: String,
    pub actual_model: String,
    pub thinking_budget: Option<u32>,
    pub thinking_level: Option<&'static str>,
    pub is_thinking_model: bool,
}

/// Claude and gemini-2.5-pro share a budget ladder; flash runs a smaller one.
const BUDGET_CLAUDE: [u32; 3] = [8192, 16384, 32768];
const BUDGET_FLASH: [u32; 3] = [6144, 12288, 24576];
const BUDGET_DEFAULT: [u32; 3] = [4096, 8192, 16384];

fn tier_index(tier: &str) -> Option<usize> {
    match tier {
        "low" => Some(0),
        "medium" => Some(1),
        "high" => Some(2),
        _ => None,
    }
}

fn tier_label(index: usize) -> &'static str {
    ["low", "medium", "high"][index]
}

fn budget_table(base: &str) -> [u32; 3] {
    if base.starts_with("claude") || base.starts_with("gemini-2.5-pro") {
        BUDGET_CLAUDE
    } else if base.starts_with("gemini-2.5-flash") {
        BUDGET_FLASH
    } else {
        BUDGET_DEFAULT
    }
}

fn is_thinking_model(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("thinking") || lower.contains("gemini-3") || lower.contains("opus")
}

/// Gemini 3 expresses effort as a level string; everything else gets a
/// numeric budget.
fn uses_thinking_level(base: &str) -> bool {
    base.starts_with("gemini-3")
}

pub fn resolve_model(requested: &str) -> ResolvedModel {
    let name = requested.trim();

    // Tier suffix: `-low`/`-medium`/`-high` strips off the actual model name.
    if let Some((base, tier)) = name.rsplit_once('-') {
        if let Some(index) = tier_index(tier) {
            if !base.is_empty() {
                return if uses_thinking_level(base) {
                    ResolvedModel {
                        requested: name.to_string(),
                        actual_model: base.to_string(),
                        thinking_budget: None,
                        thinking_level: Some(tier_label(index)),
                        is_thinking_model: true,
                    }
                } else {
                    ResolvedModel {
                        requested: name.to_string(),
                        actual_model: base.to_string(),
                        thinking_budget: Some(budget_table(base)[index]),
                        thinking_level: None,
                        is_thinking_model: is_thinking_model(base),
                    }
                };
            }
        }
    }

    ResolvedModel {
        requested: name.to_string(),
        actual_model: name.to_string(),
        thinking_budget: None,
        thinking_level: None,
        is_thinking_model: is_thinking_model(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_3_tiers_become_levels() {
        let resolved = resolve_model("gemini-3-pro-high");
        assert_eq!(resolved.actual_model, "gemini-3-pro");
        assert_eq!(resolved.thinking_level, Some("high"));
        assert_eq!(resolved.thinking_budget, None);
        assert!(resolved.is_thinking_model);
    }

    #[test]
    fn claude_thinking_tiers_become_budgets() {
        let resolved = resolve_model("claude-sonnet-4-5-thinking-low");
        assert_eq!(resolved.actual_model, "claude-sonnet-4-5-thinking");
        assert_eq!(resolved.thinking_budget, Some(8192));
        assert!(resolved.is_thinking_model);

        let resolved = resolve_model("claude-sonnet-4-5-thinking-medium");
        assert_eq!(resolved.thinking_budget, Some(16384));
        let resolved = resolve_model("claude-sonnet-4-5-thinking-high");
        assert_eq!(resolved.thinking_budget, Some(32768));
    }

    #[test]
    fn budget_tables_vary_by_base_model() {
        assert_eq!(
            resolve_model("gemini-2.5-pro-medium").thinking_budget,
            Some(16384)
        );
        assert_eq!(
            resolve_model("gemini-2.5-flash-medium").thinking_budget,
            Some(12288)
        );
        assert_eq!(
            resolve_model("some-other-model-medium").thinking_budget,
            Some(8192)
        );
    }

    #[test]
    fn untiered_models_pass_through() {
        let resolved = resolve_model("claude-sonnet-4-5");
        assert_eq!(resolved.actual_model, "claude-sonnet-4-5");
        assert_eq!(resolved.thinking_budget, None);
        assert_eq!(resolved.thinking_level, None);
        assert!(!resolved.is_thinking_model);
    }

    #[test]
    fn thinking_detection_covers_substrings() {
        assert!(resolve_model("claude-opus-4-5").is_thinking_model);
        assert!(resolve_model("gemini-3-flash").is_thinking_model);
        assert!(resolve_model("claude-sonnet-4-5-thinking").is_thinking_model);
        assert!(!resolve_model("gemini-2.5-pro").is_thinking_model);
    }

    #[test]
    fn resolution_is_idempotent() {
        for name in [
            "gemini-3-pro-high",
            "claude-sonnet-4-5-thinking-medium",
            "gemini-2.5-flash-low",
            "claude-sonnet-4-5",
        ] {
            let once = resolve_model(name);
            let twice = resolve_model(&once.actual_model);
            assert_eq!(twice.actual_model, once.actual_model);
        }
    }
}
