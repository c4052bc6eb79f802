use kinpoint_core::AppConfig;
use kinpoint_db::RepoConfig;

/// Runtime configuration from environment variables, falling back to the
/// defaults baked into `AppConfig`.
pub fn from_env() -> AppConfig {
    let defaults = AppConfig::default();
    AppConfig {
        bind_address: env_or("HOST", &defaults.bind_address),
        port: parse_port(std::env::var("PORT").ok().as_deref(), defaults.port),
        redis_url: env_or("REDIS_URL", &defaults.redis_url),
        jwt_secret: match std::env::var("JWT_SECRET") {
            Ok(secret) if !secret.trim().is_empty() => Some(secret),
            _ => defaults.jwt_secret,
        },
        cache_enabled: cache_enabled(std::env::var("CACHE_ENABLED").ok().as_deref()),
        repository: RepoConfig {
            url: non_empty(std::env::var("REPOSITORY_URL").ok()),
            anon_key: non_empty(std::env::var("REPOSITORY_ANON_KEY").ok()),
            service_key: non_empty(std::env::var("REPOSITORY_SERVICE_KEY").ok()),
        },
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.filter(|value| !value.trim().is_empty())
}

/// The cache kill switch triggers only on the literal string "false".
fn cache_enabled(raw: Option<&str>) -> bool {
    raw != Some("false")
}

fn parse_port(raw: Option<&str>, default: u16) -> u16 {
    raw.and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_switch_is_literal_false_only() {
        assert!(cache_enabled(None));
        assert!(cache_enabled(Some("true")));
        assert!(cache_enabled(Some("FALSE")));
        assert!(cache_enabled(Some("0")));
        assert!(!cache_enabled(Some("false")));
    }

    #[test]
    fn port_parsing_falls_back() {
        assert_eq!(parse_port(None, 3001), 3001);
        assert_eq!(parse_port(Some("8080"), 3001), 8080);
        assert_eq!(parse_port(Some(" 9090 "), 3001), 9090);
        assert_eq!(parse_port(Some("not-a-port"), 3001), 3001);
    }

    #[test]
    fn blank_values_mean_unset() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(Some("key".into())), Some("key".into()));
    }
}
