//! # Logging and live-tail module
//!
//! ## Why this module exists
//!
//! `tracing-subscriber`'s built-in formatters give terminal/file output but
//! no way to (a) route per-level to different sinks from a runtime-loaded
//! config, or (b) expose a bounded in-memory ring of recent records for a
//! live SSE tail endpoint (spec §3, §4.8). This module layers a custom
//! [`tracing_subscriber::Layer`] on top of the teacher's plain
//! `FmtSubscriber::builder()...init()` call (see `main.rs` in the teacher)
//! to add both.
//!
//! ## Architecture
//!
//! ```text
//! tracing::event! ──► RingLayer ──┬──► VecDeque<LogRecord> (bounded ring)
//!                                 └──► broadcast::Sender<LogRecord> (live tail)
//!                  ──► per-level fmt layers (terminal / rotating file)
//! ```

pub mod ring;

use std::path::Path;

use color_eyre::eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use ring::{LogRecord, RingLayer};

/// Installs the global tracing subscriber and returns the shared ring
/// handle used by the log-stream API endpoint (spec §4.8).
pub fn init(config: &LoggingConfig) -> Result<ring::RingHandle> {
    let (ring_layer, handle) = RingLayer::new(config.ring_capacity);

    let env_filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(ring_layer);

    if config.log_to_file {
        std::fs::create_dir_all(&config.log_dir).ok();
        let file_appender = tracing_appender::rolling::daily(&config.log_dir, "petal-app-manager.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard: it must live for the process lifetime, exactly
        // like the teacher leaks nothing but relies on `init()` running
        // exactly once for the process -- same one-shot contract here.
        std::mem::forget(guard);
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .json(),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .pretty(),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .pretty(),
            )
            .try_init()?;
    }

    Ok(handle)
}

/// Per-level output routing config (`log-output.json`, spec §6), consulted
/// by [`ring::RingLayer`] to decide whether a record also needs to reach a
/// component-specific log file (`{app}-{component}.log`).
pub fn component_log_path(log_dir: &Path, component: &str) -> std::path::PathBuf {
    log_dir.join(format!("petal-app-manager-{component}.log"))
}

pub use ring::LogRecord as Record;
