use std::sync::atomic::{ AtomicBool, Ordering };
use tracing::info;
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the global tracing subscriber once. Safe to call from every
/// entry point; later calls are no-ops.
pub struct CoordinatorLogInitializer;

impl CoordinatorLogInitializer {
    pub fn init() {
        if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
            return;
        }

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_|
            EnvFilter::new("info")
        );
        let _ = LogTracer::init();
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_ansi(true).try_init();
        info!("Logging initialized");
    }
}
