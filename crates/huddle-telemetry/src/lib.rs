use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "huddle_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

/// Handle returned by [`init_telemetry`].
pub struct TelemetryGuard {
    filter: String,
    from_env: bool,
    installed: bool,
}

impl TelemetryGuard {
    /// The filter directive built from configuration.
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Whether RUST_LOG took precedence over the configured filter.
    pub fn filter_from_env(&self) -> bool {
        self.from_env
    }

    /// False if another global subscriber was already installed.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Parse a level name as used in settings files ("info", "DEBUG", ...).
pub fn parse_level(s: &str) -> Option<Level> {
    s.trim().parse().ok()
}

/// Build an `EnvFilter` directive string from a base level and overrides.
pub fn filter_directive(level: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter = level.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Initialize logging. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = filter_directive(config.log_level, &config.module_levels);
    let (env_filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(env) => (env, true),
        Err(_) => (EnvFilter::new(&filter), false),
    };

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let installed = tracing_subscriber::registry().with(fmt_layer).try_init().is_ok();
    if !installed {
        eprintln!("huddle-telemetry: global subscriber already set");
    }

    TelemetryGuard {
        filter,
        from_env,
        installed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_without_overrides() {
        assert_eq!(filter_directive(Level::WARN, &[]), "warn");
    }

    #[test]
    fn directive_appends_module_levels() {
        let overrides = vec![
            ("huddle_engine".to_string(), Level::DEBUG),
            ("huddle_store".to_string(), Level::TRACE),
        ];
        assert_eq!(
            filter_directive(Level::INFO, &overrides),
            "info,huddle_engine=debug,huddle_store=trace"
        );
    }

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn second_init_does_not_panic() {
        let config = TelemetryConfig {
            module_levels: vec![("huddle_server".into(), Level::DEBUG)],
            ..TelemetryConfig::default()
        };
        let first = init_telemetry(config.clone());
        let second = init_telemetry(config);
        assert!(!(first.installed() && second.installed()));
        assert_eq!(second.filter(), "info,huddle_server=debug");
    }
}
