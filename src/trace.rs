use crate::util;

use chrono::Local;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Registry, prelude::*};

/// Environment variable that can be used to enable capturing logs to a JSON file in addition to
/// the standard output layer.
const LOGS_ENABLED_ENV_VAR: &str = "KAFMIRROR_LOGS_ENABLED";

/// Environment variable that can be used to specify the directory that log files should be
/// stored in. If file logs are enabled but no custom directory is specified using this
/// environment variable then the present working directory, i.e. `.`, will be used.
const LOGS_DIR_ENV_VAR: &str = "KAFMIRROR_LOGS_DIR";

/// Initializes the environment that the application will run in: loads any `.env` file and
/// installs the global tracing subscriber. Returns a guard that must be held for the lifetime of
/// the application when file logging is enabled so buffered logs are flushed on exit.
pub fn init_env() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let dot_env_result = dotenvy::dotenv();

    // default to INFO level logs but respect the RUST_LOG env var.
    let global_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_target(true)
        .with_thread_names(true);

    let (file_layer, guard) = if logs_enabled() {
        let file_appender = tracing_appender::rolling::never(
            logs_dir(),
            format!(
                "kafmirror-logs-{}.json",
                Local::now().format("%d.%m.%Y-%H.%M.%S")
            ),
        );

        let (writer, guard) = tracing_appender::non_blocking(file_appender);

        let layer = tracing_subscriber::fmt::Layer::default()
            .json()
            .with_file(true)
            .with_level(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_target(true)
            .with_writer(writer);

        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    Registry::default()
        .with(fmt_layer)
        .with(file_layer)
        .with(global_filter)
        .init();

    // process dotenvy result after tracing has been initialized to ensure any relevant logs are
    // emitted and viewable by the end user.
    match dot_env_result {
        Ok(path) => tracing::info!(".env file loaded from {}", path.display()),
        Err(e) => match e {
            dotenvy::Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no .env file found")
            }
            _ => tracing::warn!("failed to load .env file: {}", e),
        },
    };

    guard
}

/// Returns true if the user has enabled file logging, false otherwise.
fn logs_enabled() -> bool {
    util::read_env_transformed_or(
        LOGS_ENABLED_ENV_VAR,
        |v| v.eq_ignore_ascii_case("true"),
        false,
    )
}

/// Resolves the directory on the file system where the file containing the application logs
/// should be written. If not configured explicitly by the user with the `KAFMIRROR_LOGS_DIR`
/// environment variable, then the present working directory, i.e. `.`, will be used.
fn logs_dir() -> String {
    util::read_env_or(LOGS_DIR_ENV_VAR, String::from("."))
}
