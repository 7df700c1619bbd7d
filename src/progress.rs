#![forbid(unsafe_code)]

//! Client-side polling state machine with synthetic progress.
//!
//! The backend only reports coarse job status, never bytes transferred, so
//! the client fabricates a percentage that creeps upwards while polling. The
//! ramp is phase-based to feel like a real pipeline: quick early movement
//! while "fetching info", bigger steps during the "download", smaller ones
//! while "converting", and a crawl near the end. The value is capped below
//! 95 until the server actually confirms completion, so the display can
//! never show "done" for a job that later fails.

use rand::Rng;

use crate::jobs::JobStatus;

/// Displayed progress never reaches this value while the job is still
/// in flight; only a confirmed completion sets 100.
const SYNTHETIC_CAP: u8 = 94;

pub const GENERIC_FAILURE_MESSAGE: &str = "Download failed. Please try again.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReporterState {
    Idle,
    Processing,
    Completed,
    Failed,
}

/// Tracks one download from the client's point of view.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    state: ReporterState,
    download_id: Option<u64>,
    percent: u8,
    error: Option<String>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            state: ReporterState::Idle,
            download_id: None,
            percent: 0,
            error: None,
        }
    }

    pub fn state(&self) -> ReporterState {
        self.state
    }

    pub fn download_id(&self) -> Option<u64> {
        self.download_id
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Polling continues only while the server still owes us a terminal
    /// answer.
    pub fn is_polling(&self) -> bool {
        self.state == ReporterState::Processing
    }

    /// Records a successfully submitted job and enters the polling state.
    pub fn started(&mut self, download_id: u64) {
        self.state = ReporterState::Processing;
        self.download_id = Some(download_id);
        self.percent = 0;
        self.error = None;
    }

    /// Records a submission that never produced a job.
    pub fn submit_failed(&mut self, message: impl Into<String>) {
        self.state = ReporterState::Failed;
        self.download_id = None;
        self.percent = 0;
        self.error = Some(message.into());
    }

    /// Feeds one polled server status into the state machine.
    pub fn observe(&mut self, status: JobStatus, rng: &mut impl Rng) {
        if self.state != ReporterState::Processing {
            return;
        }
        match status {
            JobStatus::Completed => {
                self.percent = 100;
                self.state = ReporterState::Completed;
            }
            JobStatus::Failed => {
                self.state = ReporterState::Failed;
                self.error = Some(GENERIC_FAILURE_MESSAGE.to_string());
            }
            JobStatus::Pending | JobStatus::Processing => self.advance(rng),
        }
    }

    /// One synthetic step along the four-phase ramp.
    fn advance(&mut self, rng: &mut impl Rng) {
        let step = match self.percent {
            0..=19 => rng.gen_range(1..=4),
            20..=59 => rng.gen_range(4..=12),
            60..=89 => rng.gen_range(2..=6),
            _ => rng.gen_range(0..=1),
        };
        self.percent = (self.percent + step).min(SYNTHETIC_CAP);
    }

    /// Short label for the phase the synthetic percentage is in.
    pub fn phase_label(&self) -> &'static str {
        match self.state {
            ReporterState::Idle => "Idle",
            ReporterState::Completed => "Complete",
            ReporterState::Failed => "Failed",
            ReporterState::Processing => match self.percent {
                0..=19 => "Getting video information",
                20..=59 => "Downloading media",
                60..=89 => "Processing file",
                _ => "Finalizing",
            },
        }
    }

    /// Clears everything back to idle. Purely local; an in-flight server job
    /// keeps running and is simply never polled again.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn starts_idle() {
        let reporter = ProgressReporter::new();
        assert_eq!(reporter.state(), ReporterState::Idle);
        assert_eq!(reporter.percent(), 0);
        assert!(reporter.download_id().is_none());
        assert!(!reporter.is_polling());
    }

    #[test]
    fn started_enters_processing() {
        let mut reporter = ProgressReporter::new();
        reporter.started(3);
        assert_eq!(reporter.state(), ReporterState::Processing);
        assert_eq!(reporter.download_id(), Some(3));
        assert!(reporter.is_polling());
    }

    #[test]
    fn progress_is_monotone_and_capped_while_polling() {
        let mut reporter = ProgressReporter::new();
        let mut rng = rng();
        reporter.started(1);

        let mut previous = 0;
        for _ in 0..500 {
            reporter.observe(JobStatus::Processing, &mut rng);
            let current = reporter.percent();
            assert!(current >= previous, "progress regressed");
            assert!(current < 95, "synthetic progress reached {current}");
            previous = current;
        }
        assert!(reporter.is_polling());
    }

    #[test]
    fn completed_sets_full_progress_and_stops_polling() {
        let mut reporter = ProgressReporter::new();
        let mut rng = rng();
        reporter.started(1);
        for _ in 0..10 {
            reporter.observe(JobStatus::Processing, &mut rng);
        }
        reporter.observe(JobStatus::Completed, &mut rng);
        assert_eq!(reporter.state(), ReporterState::Completed);
        assert_eq!(reporter.percent(), 100);
        assert!(!reporter.is_polling());
    }

    #[test]
    fn failed_uses_generic_message() {
        let mut reporter = ProgressReporter::new();
        let mut rng = rng();
        reporter.started(1);
        reporter.observe(JobStatus::Failed, &mut rng);
        assert_eq!(reporter.state(), ReporterState::Failed);
        assert_eq!(reporter.error(), Some(GENERIC_FAILURE_MESSAGE));
        assert!(!reporter.is_polling());
    }

    #[test]
    fn observations_after_terminal_state_are_ignored() {
        let mut reporter = ProgressReporter::new();
        let mut rng = rng();
        reporter.started(1);
        reporter.observe(JobStatus::Completed, &mut rng);
        reporter.observe(JobStatus::Failed, &mut rng);
        assert_eq!(reporter.state(), ReporterState::Completed);
        assert_eq!(reporter.percent(), 100);
    }

    #[test]
    fn pending_advances_like_processing() {
        let mut reporter = ProgressReporter::new();
        let mut rng = rng();
        reporter.started(1);
        reporter.observe(JobStatus::Pending, &mut rng);
        assert!(reporter.percent() > 0);
    }

    #[test]
    fn reset_returns_to_idle_from_any_state() {
        let mut reporter = ProgressReporter::new();
        let mut rng = rng();
        reporter.started(9);
        reporter.observe(JobStatus::Failed, &mut rng);
        reporter.reset();
        assert_eq!(reporter.state(), ReporterState::Idle);
        assert_eq!(reporter.percent(), 0);
        assert!(reporter.download_id().is_none());
        assert!(reporter.error().is_none());
    }

    #[test]
    fn phase_labels_follow_percent_bands() {
        let mut reporter = ProgressReporter::new();
        reporter.started(1);
        assert_eq!(reporter.phase_label(), "Getting video information");
        reporter.percent = 45;
        assert_eq!(reporter.phase_label(), "Downloading media");
        reporter.percent = 75;
        assert_eq!(reporter.phase_label(), "Processing file");
        reporter.percent = 93;
        assert_eq!(reporter.phase_label(), "Finalizing");
    }
}
