//! Logging initialization.
//!
//! Controlled by two environment variables:
//! - `KEEL_LOG`: an `EnvFilter` directive (default `warn`), e.g.
//!   `KEEL_LOG=keel=debug,keel_core=trace`.
//! - `KEEL_LOG_FORMAT`: `json` for one JSON object per event, anything else
//!   (or unset) for compact human-readable lines.
//!
//! Output always goes to stderr so stdout stays machine-parseable.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Environment variable holding the filter directive.
pub const LOG_ENV: &str = "KEEL_LOG";

/// Environment variable selecting the output format.
pub const FORMAT_ENV: &str = "KEEL_LOG_FORMAT";

/// Install the global subscriber. Calling it again is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var(FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "subscriber already installed");
    }
}
