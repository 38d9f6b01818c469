use std::fs;
use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the structured logging system.
///
/// Sets up:
/// - File output: rolling log files in `{log_dir}/voice-session.*.log`
///   with daily rotation, keeping the latest 5 files.
/// - Console output (stderr). stdout is reserved for IPC events.
/// - Environment filter: defaults to `info`, configurable via `RUST_LOG`.
///
/// When the file appender cannot be created the logger still comes up on
/// stderr and the failure is reported there. Returns an error only if a
/// global subscriber is already installed.
pub fn init(log_dir: &Path) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,reqwest=warn,hyper=warn,hyper_util=warn,mio=warn")
    });

    let appender = fs::create_dir_all(log_dir)
        .map_err(anyhow::Error::from)
        .and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("voice-session")
                .filename_suffix("log")
                .max_log_files(5)
                .build(log_dir)
                .map_err(anyhow::Error::from)
        });

    let (file_appender, file_error) = match appender {
        Ok(file_appender) => (Some(file_appender), None),
        Err(e) => (None, Some(e)),
    };

    let file_layer = file_appender.map(|file_appender| {
        fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
    });

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    match file_error {
        None => tracing::info!(log_dir = %log_dir.display(), "Logger initialized"),
        Some(e) => tracing::warn!(
            log_dir = %log_dir.display(),
            "File logging disabled: {}",
            e
        ),
    }

    Ok(())
}
