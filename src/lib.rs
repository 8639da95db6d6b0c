use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

pub mod api;
pub mod chain;
pub mod config;
pub mod continuity;
pub mod cost;
pub mod encoding;
pub mod enhance;
pub mod error;
pub mod ffmpeg;
pub mod init;
pub mod job_spec;
pub mod manifest;
pub mod media;
pub mod orchestrator;
pub mod poller;
pub mod request;
pub mod state;
pub mod stitch;
pub mod store;
pub mod throttle;

pub use error::{PipelineError, PipelineResult};
pub use orchestrator::{CancelFlag, JobOutcome, JobReport, Pipeline};

/// Receives every progress line, e.g. for a front end mirroring pipeline output.
pub type PipelineLogHook = Arc<Mutex<dyn Fn(&str) + Send + Sync + 'static>>;

static LOG_HOOK: Lazy<Mutex<Option<PipelineLogHook>>> = Lazy::new(|| Mutex::new(None));

pub fn set_log_hook(hook: Option<PipelineLogHook>) {
    if let Ok(mut guard) = LOG_HOOK.lock() {
        *guard = hook;
    }
}

pub(crate) fn logv(tag: &str, message: &str) {
    match tag {
        "WARN" => tracing::warn!("{}", message),
        _ => tracing::info!("{}", message),
    }

    if let Ok(guard) = LOG_HOOK.lock() {
        if let Some(hook) = guard.as_ref() {
            if let Ok(callback) = hook.lock() {
                let line = format!("[{}] {}", tag, message);
                callback(&line);
            }
        }
    }
}

pub(crate) fn logi(message: impl AsRef<str>) {
    logv("INFO", message.as_ref());
}

pub(crate) fn logok(message: impl AsRef<str>) {
    logv("OK", message.as_ref());
}

pub(crate) fn logw(message: impl AsRef<str>) {
    logv("WARN", message.as_ref());
}
