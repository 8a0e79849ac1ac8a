//! Fixed endpoints, client identity and on-disk file names.

/// Google OAuth token endpoint (form-encoded grants).
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Google OAuth authorization endpoint (PKCE S256).
pub const OAUTH_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Loop-back redirect the external login flow listens on.
pub const OAUTH_REDIRECT_URI: &str = "http://localhost:51121/oauth-callback";

pub const OAUTH_SCOPES: &str = concat!(
    "https://www.googleapis.com/auth/cloud-platform ",
    "https://www.googleapis.com/auth/userinfo.email ",
    "https://www.googleapis.com/auth/userinfo.profile"
);

// Public CLI client credentials. Not a secret in any meaningful sense: the
// upstream ships the same pair inside its CLI distribution.
pub const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const OAUTH_CLIENT_SECRET: &str = "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";

/// Production cloudcode host. Project discovery starts here.
pub const CLOUDCODE_ENDPOINT_PROD: &str = "https://cloudcode-pa.googleapis.com";
/// Daily sandbox host. Generation prefers this one.
pub const CLOUDCODE_ENDPOINT_DAILY: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
/// Autopush sandbox host.
pub const CLOUDCODE_ENDPOINT_AUTOPUSH: &str =
    "https://autopush-cloudcode-pa.sandbox.googleapis.com";

/// Discovery order: prod first, then the two sandboxes.
pub const DISCOVERY_ENDPOINTS: [&str; 3] = [
    CLOUDCODE_ENDPOINT_PROD,
    CLOUDCODE_ENDPOINT_DAILY,
    CLOUDCODE_ENDPOINT_AUTOPUSH,
];

/// Generation order: daily sandbox, autopush, then prod.
pub const GENERATION_ENDPOINTS: [&str; 3] = [
    CLOUDCODE_ENDPOINT_DAILY,
    CLOUDCODE_ENDPOINT_AUTOPUSH,
    CLOUDCODE_ENDPOINT_PROD,
];

/// Used when neither discovery nor the user supplied a project id.
pub const FALLBACK_PROJECT_ID: &str = "bamboo-precept-lgxtn";

/// Free-tier id submitted during onboarding.
pub const ONBOARD_TIER_ID: &str = "free-tier";

pub const ACCOUNTS_FILE: &str = "antigravity-accounts.json";
pub const SIGNATURE_CACHE_FILE: &str = "antigravity-signature-cache.json";

/// Beta tag required for interleaved thinking on Claude models.
pub const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

/// Signatures shorter than this are rejected by the upstream; never cache them.
pub const MIN_SIGNATURE_LENGTH: usize = 50;

/// Access tokens within this window of expiry are treated as already expired.
pub const TOKEN_EXPIRY_SKEW_MS: i64 = 60_000;

// Per-call network timeouts (seconds).
pub const OAUTH_TIMEOUT_SECS: u64 = 30;
pub const DISCOVERY_TIMEOUT_SECS: u64 = 10;
pub const REGISTRY_TIMEOUT_SECS: u64 = 5;
