use brokersync::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,brokersync=debug,sqlx=warn";

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.level.eq_ignore_ascii_case("info") {
            EnvFilter::new(DEFAULT_FILTER)
        } else {
            EnvFilter::new(format!("{},sqlx=warn", config.level))
        }
    })
}

/// Console plus optional daily rolling file logging for the service.
///
/// The returned guard flushes the file writer and must be held for the
/// life of the process.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let log_dir = config
        .dir
        .clone()
        .or_else(|| std::env::var("BROKERSYNC_LOG_DIR").ok());

    // `rolling::daily` panics if it cannot create the first file, so check
    // the directory is writable first.
    let (file_layer, guard) = match log_dir.as_deref().map(prepare_log_dir) {
        Some(Ok(dir)) => {
            let appender = tracing_appender::rolling::daily(&dir, "brokersync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            eprintln!("Logging to: {}/brokersync.log", dir);
            (Some(layer), Some(guard))
        }
        Some(Err(message)) => {
            eprintln!("Warning: {}, file logging disabled", message);
            (None, None)
        }
        None => (None, None),
    };

    let (text_layer, json_layer) = if config.json {
        (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
        )
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    guard
}

fn prepare_log_dir(dir: &str) -> Result<String, String> {
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("could not create log directory {} ({})", dir, e))?;

    let probe = std::path::Path::new(dir).join(".brokersync_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)
        .map_err(|e| format!("could not write to log directory {} ({})", dir, e))?;
    let _ = std::fs::remove_file(&probe);

    Ok(dir.to_string())
}

/// Warnings only, for one-shot CLI commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();
}
