use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "emotion-client.logs.jsonl";
/// Client events at `info`, dependencies (hyper, reqwest, rustls) only when
/// they warn.
const DEFAULT_FILTER: &str = "warn,emotion_analysis_client=info";

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn observability_enabled() -> bool {
    match std::env::var("EMOTION_CLIENT_OBSERVABILITY") {
        Ok(value) => parse_bool_env(&value).unwrap_or(true),
        Err(_) => true,
    }
}

fn resolve_env_filter() -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var("EMOTION_CLIENT_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the process-wide tracing subscriber. Later calls do nothing.
///
/// Environment variables:
/// - `EMOTION_CLIENT_OBSERVABILITY`: set to `off`/`false`/`0` to skip installation.
/// - `EMOTION_CLIENT_LOG_LEVEL`: filter override (`info`, `emotion_analysis_client=debug`, ...).
/// - `EMOTION_CLIENT_JSON_LOG_PATH`: write flat JSON lines to this file instead
///   of compact console output on stderr, keeping stdout free for results.
/// - `RUST_LOG`: used when no level override is set.
///
/// Without either filter variable, this crate logs at `info` and its
/// dependencies only at `warn`.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !observability_enabled() {
            return;
        }

        let env_filter = resolve_env_filter();
        if let Ok(path_raw) = std::env::var("EMOTION_CLIENT_JSON_LOG_PATH") {
            let path = std::path::PathBuf::from(path_raw);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                let _ = std::fs::create_dir_all(parent);
            }
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(DEFAULT_LOG_FILE);
            let writer = tracing_appender::rolling::never(dir, file_name);
            // one flat object per event: session_id, sequence etc. sit next to
            // the message so a log processor can filter on them directly
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false)
                .with_target(true)
                .with_thread_names(true)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_values() {
        assert_eq!(parse_bool_env(" OFF "), Some(false));
        assert_eq!(parse_bool_env("enabled"), Some(true));
        assert_eq!(parse_bool_env("maybe"), None);
    }

    #[test]
    fn default_filter_is_valid() {
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn init_is_idempotent() {
        init_observability();
        init_observability();
        assert!(INIT.get().is_some());
    }
}
