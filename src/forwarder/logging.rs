use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::forwarder::config;

/// Keeps the non-blocking writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let fmt = logging.format.trim().to_ascii_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level)))
        .context("logging: init filter")?;

    let output = LogOutput::parse(&logging.output);
    let (writer, guard) = make_writer(&output)?;

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text" && output == LogOutput::Stderr)
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = if fmt == "json" {
        base_fmt.json().boxed()
    } else {
        base_fmt.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// File name used by `output = "file"` and by daily rotation in a directory.
pub const LOG_FILE_NAME: &str = "local-forwarder.log";

/// Where log lines go, parsed from `logging.output`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    /// Appends to one file.
    File(PathBuf),
    /// Rotates `LOG_FILE_NAME` daily inside a directory.
    Daily(PathBuf),
}

impl LogOutput {
    /// `stderr` (also empty), `stdout`, `discard`, `file` for
    /// `./local-forwarder.log`, a directory (existing, or written with a
    /// trailing `/`) for daily files, or any other path for a single file.
    fn parse(output: &str) -> Self {
        match output.trim() {
            "" | "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            "discard" => LogOutput::Discard,
            "file" => LogOutput::File(PathBuf::from(LOG_FILE_NAME)),
            other if other.ends_with('/') || Path::new(other).is_dir() => LogOutput::Daily(PathBuf::from(other)),
            other => LogOutput::File(PathBuf::from(other)),
        }
    }
}

fn make_writer(output: &LogOutput) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    match output {
        LogOutput::Stderr => Ok(tracing_appender::non_blocking(io::stderr())),
        LogOutput::Stdout => Ok(tracing_appender::non_blocking(io::stdout())),
        LogOutput::Discard => Ok(tracing_appender::non_blocking(io::sink())),
        LogOutput::Daily(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("logging: mkdir {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_NAME)
                .build(dir)
                .with_context(|| format!("logging: open daily log in {}", dir.display()))?;
            Ok(tracing_appender::non_blocking(appender))
        }
        LogOutput::File(p) => {
            if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| format!("logging: mkdir {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(level_directive(" DEBUG "), "debug");
        assert_eq!(level_directive("verbose"), "info");
        assert_eq!(level_directive(""), "info");
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("forwarder_log_test_{}", std::process::id()));
        let path = dir.join("nested").join("forwarder.log");

        let (_writer, _guard) = make_writer(&LogOutput::parse(path.to_str().unwrap())).unwrap();
        assert!(path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn output_names() {
        assert_eq!(LogOutput::parse(""), LogOutput::Stderr);
        assert_eq!(LogOutput::parse(" stdout "), LogOutput::Stdout);
        assert_eq!(LogOutput::parse("discard"), LogOutput::Discard);
        assert_eq!(LogOutput::parse("file"), LogOutput::File(PathBuf::from(LOG_FILE_NAME)));
        assert_eq!(LogOutput::parse("logs/"), LogOutput::Daily(PathBuf::from("logs/")));
        assert_eq!(
            LogOutput::parse("/var/log/fwd.log"),
            LogOutput::File(PathBuf::from("/var/log/fwd.log"))
        );
    }

    #[test]
    fn directory_output_rotates_inside_it() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("forwarder_log_daily_{}", std::process::id()));
        let out = LogOutput::parse(&format!("{}/", dir.display()));
        assert!(matches!(out, LogOutput::Daily(_)));

        let (_writer, _guard) = make_writer(&out).unwrap();
        assert!(dir.is_dir());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
