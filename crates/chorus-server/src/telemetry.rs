//! Global `tracing` subscriber.

use chorus_settings::TelemetrySettings;
use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber. `RUST_LOG` overrides
/// `settings.level`. Later calls are no-ops.
pub fn init_telemetry(settings: &TelemetrySettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let _ = if settings.json {
        builder.json().flatten_event(true).with_current_span(true).try_init()
    } else {
        builder.compact().try_init()
    };
}
