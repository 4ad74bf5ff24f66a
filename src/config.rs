//! Environment-driven configuration
//!
//! All settings come from environment variables with sensible defaults, so
//! the service runs unconfigured on a developer machine and picks up its
//! production values from the container environment.

use std::env;

/// Message size cap applied to inbound SMTP DATA. Not configurable.
pub const DATA_SIZE_LIMIT_BYTES: usize = 128 * 1024;

#[derive(Debug, Clone)]
pub struct Settings {
    pub debug: bool,

    // Storage
    pub use_in_memory_store: bool,
    pub redis_url: String,

    // SMTP server
    pub smtp_host: String,
    pub smtp_port: u16,
    pub sms_inbound_address: String,
    pub dump_inbound: bool,

    // HTTP server
    pub http_host: String,
    pub http_port: u16,
    pub cors_allow_origins: Vec<String>,

    // Verification lifecycle
    pub auth_ttl_seconds: i64,
    pub verified_ttl_seconds: i64,
    pub data_size_limit_bytes: usize,

    // JWT
    pub jwt_private_key_pem: String,
    pub jwt_issuer: String,
    pub jwt_ttl_seconds: i64,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            debug: parse_bool(env_var("DEBUG"), false),

            use_in_memory_store: parse_bool(env_var("USE_IN_MEMORY_STORE"), false),
            redis_url: env_var("REDIS_URL").unwrap_or_default(),

            smtp_host: env_var("SMTP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            smtp_port: parse_int(env_var("SMTP_PORT"), 2525),
            sms_inbound_address: env_var("SMS_INBOUND_ADDRESS")
                .unwrap_or_else(|| "verify@example.com".to_string()),
            dump_inbound: parse_bool(env_var("DUMP_INBOUND"), false),

            http_host: env_var("HTTP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            http_port: parse_int(env_var("HTTP_PORT"), 8000),
            cors_allow_origins: parse_list(env_var("CORS_ALLOW_ORIGINS"), &["*"]),

            auth_ttl_seconds: parse_int(env_var("AUTH_TTL_SECONDS"), 600),
            verified_ttl_seconds: parse_int(env_var("VERIFIED_TTL_SECONDS"), 300),
            data_size_limit_bytes: DATA_SIZE_LIMIT_BYTES,

            jwt_private_key_pem: env_var("JWT_PRIVATE_KEY").unwrap_or_default(),
            jwt_issuer: env_var("JWT_ISSUER").unwrap_or_else(|| "https://example.com".to_string()),
            jwt_ttl_seconds: parse_int(env_var("JWT_TTL_SECONDS"), 3600),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            use_in_memory_store: true,
            redis_url: String::new(),
            smtp_host: "0.0.0.0".to_string(),
            smtp_port: 2525,
            sms_inbound_address: "verify@example.com".to_string(),
            dump_inbound: false,
            http_host: "0.0.0.0".to_string(),
            http_port: 8000,
            cors_allow_origins: vec!["*".to_string()],
            auth_ttl_seconds: 600,
            verified_ttl_seconds: 300,
            data_size_limit_bytes: DATA_SIZE_LIMIT_BYTES,
            jwt_private_key_pem: String::new(),
            jwt_issuer: "https://example.com".to_string(),
            jwt_ttl_seconds: 3600,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Accepts 1/true/yes/on and 0/false/no/off, case-insensitive. Anything else
/// falls back to the default.
fn parse_bool(value: Option<String>, default: bool) -> bool {
    let Some(value) = value else {
        return default;
    };
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_int<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parses either a JSON array (`["a","b"]`) or a comma-separated list.
/// Empty or unparseable input falls back to the default.
fn parse_list(value: Option<String>, default: &[&str]) -> Vec<String> {
    let fallback = || default.iter().map(|s| s.to_string()).collect();

    let Some(value) = value else {
        return fallback();
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return fallback();
    }

    if trimmed.starts_with('[') {
        match serde_json::from_str::<Vec<String>>(trimmed) {
            Ok(parsed) if !parsed.is_empty() => return parsed,
            _ => return fallback(),
        }
    }

    let out: Vec<String> = trimmed
        .split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect();
    if out.is_empty() {
        return fallback();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    #[test]
    fn test_parse_bool_variants() {
        assert!(parse_bool(s("1"), false));
        assert!(parse_bool(s("TRUE"), false));
        assert!(parse_bool(s(" yes "), false));
        assert!(parse_bool(s("on"), false));
        assert!(!parse_bool(s("0"), true));
        assert!(!parse_bool(s("off"), true));
        assert!(parse_bool(s("maybe"), true));
        assert!(!parse_bool(None, false));
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int(s(" 42 "), 0), 42);
        assert_eq!(parse_int(s("not-a-number"), 7), 7);
        assert_eq!(parse_int::<u16>(None, 2525), 2525);
    }

    #[test]
    fn test_parse_list_json_array() {
        let got = parse_list(s(r#"["https://a.example","https://b.example"]"#), &["*"]);
        assert_eq!(got, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn test_parse_list_comma_separated() {
        let got = parse_list(s("https://a.example, https://b.example ,"), &["*"]);
        assert_eq!(got, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn test_parse_list_falls_back() {
        assert_eq!(parse_list(None, &["*"]), vec!["*"]);
        assert_eq!(parse_list(s("   "), &["*"]), vec!["*"]);
        assert_eq!(parse_list(s("[not json"), &["*"]), vec!["*"]);
        assert_eq!(parse_list(s("[]"), &["*"]), vec!["*"]);
    }

    #[test]
    fn test_data_size_limit_is_fixed() {
        let settings = Settings::default();
        assert_eq!(settings.data_size_limit_bytes, 128 * 1024);
    }
}
