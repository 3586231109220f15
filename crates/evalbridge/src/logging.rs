//! Tracing subscriber setup.
//!
//! Always writes to stderr: in a worker process stdout carries the channel.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Base level when `RUST_LOG` is unset: debug, info, warn or error.
pub const ENV_LOG_LEVEL: &str = "EVALBRIDGE_LOG";

fn default_filter(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("evalbridge={level},evalbridge::bridge::codec=off")
}

/// Install the global subscriber. Safe to call more than once.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(std::env::var(ENV_LOG_LEVEL).ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}
