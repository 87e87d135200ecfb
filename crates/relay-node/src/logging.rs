use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn from_var(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the global subscriber in the format named by `LOG_FORMAT` (`json` or `pretty`)
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_from_env() {
    let format = LogFormat::from_var(std::env::var("LOG_FORMAT").ok().as_deref());
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().with_target(true).with_line_number(true).json())
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).compact())
            .init(),
    }

    tracing::debug!("Logging initialized ({:?})", format);
}
