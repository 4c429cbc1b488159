//! Tracing subscriber setup.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use trellis_config::ObservabilityConfig;

const LOG_FILE_ENV: &str = "TRELLIS_LOG_FILE";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once per process.
///
/// `RUST_LOG` wins over `observability.log_level`; `TRELLIS_LOG_FILE` wins
/// over `observability.log_file`. Without a usable file, logs go to stderr.
pub fn init_tracing(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let log_file = std::env::var(LOG_FILE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| observability.log_file.clone());
        let file = log_file.as_deref().and_then(open_log_file);
        let to_file = file.is_some();
        let writer = match file {
            Some(file) => BoxMakeWriter::new(Arc::new(file)),
            None => BoxMakeWriter::new(std::io::stderr),
        };

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(normalize_level(&observability.log_level)))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let span_events = if observability.traces_enabled {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_ansi(!to_file)
            .with_span_events(span_events)
            .with_writer(writer)
            .try_init();

        let destination = match (&log_file, to_file) {
            (Some(path), true) => path.as_str(),
            _ => "(stderr)",
        };
        tracing::info!(
            log_level = %observability.log_level,
            traces_enabled = observability.traces_enabled,
            log_file = destination,
            "tracing initialized"
        );
    });
}

fn normalize_level(raw: &str) -> &'static str {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Open `path` for appending, creating parent directories. Failures are
/// reported on stderr since no subscriber exists yet.
fn open_log_file(path: &str) -> Option<File> {
    let path = Path::new(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("trellis: cannot create log dir {}: {}", parent.display(), err);
            return None;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| eprintln!("trellis: cannot open log file {}: {}", path.display(), err))
        .ok()
}
