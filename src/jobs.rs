#![forbid(unsafe_code)]

//! In-memory bookkeeping for download jobs.
//!
//! Every download request becomes a [`Job`] that moves forward through
//! `pending -> processing -> completed | failed` and never backwards. The
//! store lives for the lifetime of the process only; restarting the backend
//! forgets every job, which is fine because the files it serves are meant to
//! be fetched exactly once.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// The two deliverables a job can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Video,
    Audio,
}

impl MediaFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    /// File extension used for the on-disk sink and the attachment name.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "mp3",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Video => "video/mp4",
            Self::Audio => "audio/mpeg",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position along the forward-only lifecycle. Both terminal states share
    /// the same rank because neither may replace the other.
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }
}

/// One user-initiated download request and everything we know about it.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: u64,
    pub url: String,
    pub format: MediaFormat,
    pub status: JobStatus,
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration: Option<String>,
    pub thumbnail: Option<String>,
    pub file_size: Option<String>,
    pub file_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// Partial update merged into an existing job. `None` fields are left alone.
#[derive(Clone, Debug, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub duration: Option<String>,
    pub thumbnail: Option<String>,
    pub file_size: Option<String>,
    pub file_path: Option<PathBuf>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Process-local job table. Constructed once at startup and shared between
/// the request handlers and the background pipelines via `Arc`.
pub struct JobStore {
    jobs: Mutex<HashMap<u64, Job>>,
    counter: AtomicU64,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh id and inserts a pending job with no metadata.
    pub fn create(&self, url: &str, format: MediaFormat) -> Job {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            id,
            url: url.to_string(),
            format,
            status: JobStatus::Pending,
            title: None,
            author: None,
            duration: None,
            thumbnail: None,
            file_size: None,
            file_path: None,
            created_at: Utc::now(),
        };
        self.jobs.lock().insert(id, job.clone());
        job
    }

    pub fn get(&self, id: u64) -> Option<Job> {
        self.jobs.lock().get(&id).cloned()
    }

    /// Merges the update into the job, returning the new snapshot. A status
    /// that would move the job backwards is dropped; the other fields still
    /// apply. Readers therefore never observe a regression.
    pub fn update(&self, id: u64, update: JobUpdate) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&id)?;

        if let Some(status) = update.status
            && status.rank() >= job.status.rank()
            && !job.status.is_terminal()
        {
            job.status = status;
        }
        if let Some(title) = update.title {
            job.title = Some(title);
        }
        if let Some(author) = update.author {
            job.author = Some(author);
        }
        if let Some(duration) = update.duration {
            job.duration = Some(duration);
        }
        if let Some(thumbnail) = update.thumbnail {
            job.thumbnail = Some(thumbnail);
        }
        if let Some(file_size) = update.file_size {
            job.file_size = Some(file_size);
        }
        if let Some(file_path) = update.file_path {
            job.file_path = Some(file_path);
        }

        Some(job.clone())
    }

    pub fn delete(&self, id: u64) -> bool {
        self.jobs.lock().remove(&id).is_some()
    }
}

/// Renders a byte count with powers-of-1024 units and up to two decimals,
/// e.g. `1536 -> "1.5 KB"`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rendered = format!("{value:.2}");
    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", rendered, UNITS[unit])
}

/// Formats a duration in whole seconds as `M:SS`.
pub fn format_duration(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}
