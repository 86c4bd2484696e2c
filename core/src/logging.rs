// Logging setup
//
// `RUST_LOG` overrides the filter passed in. Installing twice is harmless:
// the second call leaves the existing subscriber in place. The log file gets
// one JSON object per event.

use std::path::Path;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "swarmlink.log";

/// Install the global tracing subscriber.
///
/// With `log_dir`, output also goes to a daily-rolling file in that directory;
/// keep the returned guard alive for as long as file logging is wanted.
pub fn init_logging(filter: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match log_dir {
        Some(dir) => {
            let (file_layer, guard) = json_file_layer(dir);
            let installed = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer())
                .with(file_layer)
                .try_init()
                .is_ok();
            installed.then_some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
            None
        }
    }
}

/// Daily-rolling JSON log file in `dir`
fn json_file_layer<S>(dir: &Path) -> (impl Layer<S>, WorkerGuard)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
    (layer, guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_log_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let (layer, guard) = json_file_layer(dir.path());
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(peer = "abcd", "Contact added");
        });
        // Dropping the guard flushes the background writer
        drop(guard);

        let file = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .find(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
            .expect("no log file written");
        let contents = std::fs::read_to_string(file.path()).unwrap();
        let line = contents.lines().next().expect("empty log file");
        let event: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(event["fields"]["message"], "Contact added");
        assert_eq!(event["fields"]["peer"], "abcd");
        assert_eq!(event["level"], "INFO");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logging("debug", None);
        init_logging("info", None);
        let dir = tempfile::tempdir().unwrap();
        // A subscriber is already installed, so no file writer is created
        assert!(init_logging("info", Some(dir.path())).is_none());
    }
}
