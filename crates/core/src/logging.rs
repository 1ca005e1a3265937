//! Logging setup for engine runs
//!
//! Installs a tracing-subscriber registry with either human-readable text or
//! structured JSON output, selected at runtime. Output goes to stderr so a host
//! reporting results on stdout is not disturbed.

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Filter directive variable, takes precedence over `RUST_LOG`
pub const LOG_ENV: &str = "TRELLIS_LOG";
/// Output format variable (`json` or `text`)
pub const LOG_FORMAT_ENV: &str = "TRELLIS_LOG_FORMAT";
/// Span lifecycle events variable (`new`, `close`, `enter`, `exit`, `active`, `full`, `none`)
pub const LOG_SPAN_EVENTS_ENV: &str = "TRELLIS_LOG_SPAN_EVENTS";

/// Initialize logging with an optional format
///
/// Safe to call more than once; only the first call installs a subscriber.
///
/// ## Arguments
///
/// * `format` - `None` or `"text"` for text output, `"json"` for JSON. When
///   `None`, `TRELLIS_LOG_FORMAT` is consulted.
///
/// ## Environment Variables
///
/// * `TRELLIS_LOG` - filter directives, e.g. `trellis_core=debug`
/// * `RUST_LOG` - used when `TRELLIS_LOG` is unset
/// * `TRELLIS_LOG_FORMAT` - `json` or `text`
/// * `TRELLIS_LOG_SPAN_EVENTS` - comma or pipe separated span events
///
/// ## Example
///
/// ```rust
/// use trellis_core::logging;
///
/// logging::init(Some("json")).expect("Failed to initialize logging");
/// ```
pub fn init(format: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter(None);

        let env_format = std::env::var(LOG_FORMAT_ENV).ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");

        // text: NONE, json: NEW | CLOSE unless overridden
        let span_events = span_events_for_format(effective_format);

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_thread_names(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

/// Build the filter from explicit directives, `TRELLIS_LOG`, `RUST_LOG`, or `info`
fn create_env_filter(explicit: Option<&str>) -> EnvFilter {
    let directives = explicit
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_ENV).ok());
    match directives {
        Some(directives) => EnvFilter::try_new(&directives).unwrap_or_else(|_| {
            tracing::warn!(
                "Invalid log filter directives '{}', using default 'info'",
                directives
            );
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

fn span_events_for_format(format: &str) -> fmt::format::FmtSpan {
    match std::env::var(LOG_SPAN_EVENTS_ENV) {
        Ok(raw) => parse_span_events(&raw),
        Err(_) => match format {
            "json" => fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE,
            _ => fmt::format::FmtSpan::NONE,
        },
    }
}

fn parse_span_events(raw: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    let mut acc = FmtSpan::NONE;
    for token in raw.split(&[',', '|'][..]).map(|t| t.trim().to_lowercase()) {
        acc |= match token.as_str() {
            "new" => FmtSpan::NEW,
            "close" => FmtSpan::CLOSE,
            "enter" => FmtSpan::ENTER,
            "exit" => FmtSpan::EXIT,
            "active" => FmtSpan::ACTIVE,
            "full" => FmtSpan::FULL,
            _ => FmtSpan::NONE,
        };
    }
    acc
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
