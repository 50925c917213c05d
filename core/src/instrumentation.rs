use std::sync::Once;

static INIT: Once = Once::new();

pub fn init_instrumentation() {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .finish();

        #[allow(clippy::expect_used)] // Runs once at startup
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
    });
}
