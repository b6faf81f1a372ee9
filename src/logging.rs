use std::sync::OnceLock;

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

#[cfg(target_os = "macos")]
pub fn init() {
    use log::LevelFilter;
    use oslog::OsLogger;

    LOGGER_INIT.get_or_init(|| {
        if let Err(err) = OsLogger::new("com.whalewatch.daemon")
            .level_filter(LevelFilter::Info)
            .init()
        {
            eprintln!("failed to initialize unified logging: {err}");
        }
    });
}

/// Routes `log` records through a tracing fmt subscriber. `RUST_LOG` overrides
/// the default `info` filter.
#[cfg(not(target_os = "macos"))]
pub fn init() {
    use tracing_subscriber::EnvFilter;

    LOGGER_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        if let Err(err) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
            eprintln!("failed to initialize logging: {err}");
        }
    });
}
