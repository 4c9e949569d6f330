//! Pipeline stages and the cooperative control plumbing they share.

use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use bolag_core::models::JobStatus;
use bolag_core::{ScrapeResult, StagingStore};

pub mod financials;
pub mod id_resolution;
pub mod segmentation;

/// How a stage run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    Completed,
    Paused,
    Stopped,
}

/// In-memory pause/stop flags for one live job. Workers poll these between
/// requests; cancellation never aborts an in-flight request, it only
/// prevents follow-on ones.
#[derive(Debug, Default)]
pub struct JobHandle {
    pause: AtomicBool,
    stop: AtomicBool,
}

impl JobHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.pause.load(Ordering::SeqCst)
    }

    pub fn signal(&self) -> ControlSignal {
        if self.stop.load(Ordering::SeqCst) {
            ControlSignal::Stop
        } else if self.pause.load(Ordering::SeqCst) {
            ControlSignal::Pause
        } else {
            ControlSignal::Continue
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Continue,
    Pause,
    Stop,
}

/// Combine the in-memory handle with the persisted job status, so a pause or
/// stop issued from another process is honored too.
pub(crate) async fn control_signal(
    handle: &JobHandle,
    store: &StagingStore,
    job_id: Uuid,
) -> ScrapeResult<ControlSignal> {
    match handle.signal() {
        ControlSignal::Continue => {}
        signal => return Ok(signal),
    }
    Ok(match store.job_status(job_id).await? {
        Some(JobStatus::Stopped) => ControlSignal::Stop,
        Some(JobStatus::Paused) => ControlSignal::Pause,
        _ => ControlSignal::Continue,
    })
}

/// Cap a job-level failure string; full detail stays on the staging rows.
pub(crate) fn truncate_error(message: &str) -> String {
    const MAX: usize = 500;
    if message.len() <= MAX {
        message.to_string()
    } else {
        let mut cut = MAX;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &message[..cut])
    }
}
