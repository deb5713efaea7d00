//! Tracing setup: stdout in foreground mode, syslog with a file fallback
//! in daemon mode.
//!
//! Grounded on `zebra-rs/src/main.rs`'s
//! `setup_tracing`/`SyslogWriter`/`tracing_set`, adapted to this
//! controller's daemon/foreground split.

use std::io;
use std::path::Path;

use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
pub enum LoggingOutput<'a> {
    Stdout,
    Syslog,
    /// `log_path` is a directory (the same one the collaborator and
    /// stage-transition timestamp files are written under); the tracing
    /// sink lands at `log_path/controller.log`.
    File(&'a Path),
}

pub fn init(daemon_mode: bool, log_path: &Path) {
    if daemon_mode {
        setup(LoggingOutput::Syslog).unwrap_or_else(|e| {
            eprintln!("failed to set up syslog logging: {e}, falling back to file");
            setup(LoggingOutput::File(log_path)).unwrap_or_else(|e| {
                eprintln!("failed to set up file logging: {e}, discarding logs");
                tracing_subscriber::fmt()
                    .with_max_level(Level::INFO)
                    .with_writer(io::sink)
                    .init();
            });
        });
    } else {
        setup(LoggingOutput::Stdout).unwrap_or_else(|e| {
            eprintln!("failed to set up stdout logging: {e}");
            tracing_subscriber::fmt().with_max_level(Level::INFO).init();
        });
    }
}

fn setup(output: LoggingOutput) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match output {
        LoggingOutput::Stdout => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(false)
                .with_line_number(false)
                .init();
        }
        LoggingOutput::Syslog => {
            use std::io::Write;
            use std::sync::Mutex;
            use syslog::{Facility, Formatter3164};

            struct SyslogWriter {
                logger: Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>,
            }

            impl SyslogWriter {
                fn new() -> anyhow::Result<Self> {
                    let formatter = Formatter3164 {
                        facility: Facility::LOG_DAEMON,
                        hostname: None,
                        process: "real-controller".to_string(),
                        pid: std::process::id(),
                    };
                    let logger = syslog::unix(formatter)
                        .map_err(|e| anyhow::anyhow!("failed to connect to syslog: {e}"))?;
                    Ok(SyslogWriter { logger: Mutex::new(logger) })
                }
            }

            impl Write for SyslogWriter {
                fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                    if let Ok(mut logger) = self.logger.lock() {
                        let msg = String::from_utf8_lossy(buf);
                        let _ = logger.info(msg.trim());
                    }
                    Ok(buf.len())
                }

                fn flush(&mut self) -> io::Result<()> {
                    Ok(())
                }
            }

            let writer = SyslogWriter::new()?;
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(writer))
                .with_target(false)
                .with_thread_ids(true)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false);

            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LoggingOutput::File(dir) => {
            std::fs::create_dir_all(dir)?;
            let writer = rolling::never(dir, "controller.log");
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
    Ok(())
}
