//! Logging setup from [`LogConfig`]

use nostrtc_config::LogConfig;
use tracing_subscriber::EnvFilter;

/// Filter from RUST_LOG, or the configured level, plus the configured directives
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    for directive in &config.directives {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log directive {:?}: {}", directive, e),
        }
    }
    filter
}

/// `k=v` pairs attached to the root span
pub fn format_tags(config: &LogConfig) -> String {
    config
        .tags
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber, writing to stderr
pub fn init(config: &LogConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(std::io::stderr);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Root span for everything the process does
pub fn root_span(config: &LogConfig, local_id: &str) -> tracing::Span {
    let local = nostrtc::short_id(local_id);
    if config.tags.is_empty() {
        tracing::info_span!("nostrtc", local = %local)
    } else {
        tracing::info_span!("nostrtc", local = %local, tags = %format_tags(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_tags_sorted() {
        let mut config = LogConfig::default();
        config.tags.insert("room".to_string(), "lobby".to_string());
        config.tags.insert("app".to_string(), "chat".to_string());
        assert_eq!(format_tags(&config), "app=chat,room=lobby");
    }

    #[test]
    fn test_bad_directive_is_skipped() {
        let config = LogConfig {
            level: "warn".to_string(),
            directives: vec!["nostr_relay_pool=off".to_string(), "=[=".to_string()],
            ..Default::default()
        };
        let filter = env_filter(&config).to_string();
        assert!(filter.contains("nostr_relay_pool=off"));
    }
}
