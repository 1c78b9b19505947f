//! Telemetry helpers for structured logging and tracing.

/// Initialize tracing/telemetry. Users can install their own subscriber; this
/// helper loads `.env` (so `RUST_LOG` can live there) and installs a default
/// env-based subscriber if none is set.
pub fn init_telemetry() {
    let _ = dotenvy::dotenv();
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::init_telemetry;

    #[test]
    fn init_is_idempotent() {
        init_telemetry();
        init_telemetry();
    }
}
