//! Client-side progress estimation for a single download.
//!
//! The server reports no phases, only the HTTP body itself. Everything before
//! the first byte-progress event is synthetic: a slow timer-driven ramp while
//! the asset is looked up, then a fixed-delay jump to `Processing`. Callers own
//! the timers and feed their firings in; the estimator only turns events into
//! snapshots. Once real bytes arrive, timer events are ignored.

use rand::Rng;
use tokio::time::{Duration, Instant};

use crate::transfer::MediaKind;

/// Percent never exceeded before completion when the total size is unknown.
pub const UNKNOWN_SIZE_CEILING: f64 = 95.0;
/// Below this percent no ETA is reported.
pub const MIN_ETA_PERCENT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Idle,
    Fetching,
    Processing,
    Downloading,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Processing => "processing",
            Self::Downloading => "downloading",
        }
    }
}

/// Tuning for one media kind. Video assumes slower server-side preparation, so
/// it ramps slower and reserves a smaller head of the range for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Profile {
    pub ramp_interval: Duration,
    pub ramp_step: (f64, f64),
    pub ramp_ceiling: f64,
    pub processing_delay: Duration,
    pub processing_percent: f64,
    /// Percent reserved before real bytes; known sizes map into `head..=100`.
    pub head: f64,
    /// Fraction of real bytes after which the phase becomes `Downloading`.
    pub downloading_fraction: f64,
    pub unknown_step: (f64, f64),
    pub unknown_downloading_above: f64,
}

pub const AUDIO_PROFILE: Profile = Profile {
    ramp_interval: Duration::from_millis(600),
    ramp_step: (0.5, 2.5),
    ramp_ceiling: 10.0,
    processing_delay: Duration::from_millis(1500),
    processing_percent: 12.0,
    head: 20.0,
    downloading_fraction: 0.1,
    unknown_step: (3.0, 11.0),
    unknown_downloading_above: 30.0,
};

pub const VIDEO_PROFILE: Profile = Profile {
    ramp_interval: Duration::from_millis(800),
    ramp_step: (0.3, 1.8),
    ramp_ceiling: 8.0,
    processing_delay: Duration::from_millis(2500),
    processing_percent: 10.0,
    head: 15.0,
    downloading_fraction: 0.05,
    unknown_step: (2.0, 8.0),
    unknown_downloading_above: 25.0,
};

impl Profile {
    pub fn for_kind(kind: MediaKind) -> &'static Profile {
        match kind {
            MediaKind::Audio => &AUDIO_PROFILE,
            MediaKind::Video => &VIDEO_PROFILE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub percent: f64,
    pub eta: Option<Duration>,
}

#[derive(Debug)]
pub struct ProgressEstimator {
    profile: &'static Profile,
    phase: Phase,
    percent: f64,
    started_at: Option<Instant>,
    real_progress: bool,
}

impl ProgressEstimator {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            profile: Profile::for_kind(kind),
            phase: Phase::Idle,
            percent: 0.0,
            started_at: None,
            real_progress: false,
        }
    }

    pub fn profile(&self) -> &'static Profile {
        self.profile
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    /// Whether the synthetic timers should still be running.
    pub fn timers_active(&self) -> bool {
        self.phase != Phase::Idle && !self.real_progress
    }

    pub fn start(&mut self, now: Instant) -> ProgressSnapshot {
        self.phase = Phase::Fetching;
        self.percent = 0.0;
        self.started_at = Some(now);
        self.real_progress = false;
        self.snapshot(now)
    }

    /// One firing of the ramp timer. `None` when the event no longer applies.
    pub fn tick<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> Option<ProgressSnapshot> {
        if !self.timers_active() || self.percent >= self.profile.ramp_ceiling {
            return None;
        }

        let (low, high) = self.profile.ramp_step;
        let step = rng.gen_range(low..high);
        self.percent = (self.percent + step).min(self.profile.ramp_ceiling);
        Some(self.snapshot(now))
    }

    pub fn processing_timer_fired(&mut self, now: Instant) -> Option<ProgressSnapshot> {
        if !self.timers_active() {
            return None;
        }

        self.phase = self.phase.max(Phase::Processing);
        self.percent = self.percent.max(self.profile.processing_percent);
        Some(self.snapshot(now))
    }

    /// A real byte-progress event from the transfer. `total` is the announced
    /// body length, if any.
    pub fn on_bytes<R: Rng + ?Sized>(
        &mut self,
        loaded: u64,
        total: Option<u64>,
        now: Instant,
        rng: &mut R,
    ) -> ProgressSnapshot {
        if self.phase == Phase::Idle {
            return self.snapshot(now);
        }
        self.real_progress = true;

        let (percent, phase) = match total.filter(|total| *total > 0) {
            Some(total) => {
                let fraction = (loaded as f64 / total as f64).min(1.0);
                let head = self.profile.head;
                let percent = (head + fraction * (100.0 - head)).round();
                let phase = if fraction > self.profile.downloading_fraction {
                    Phase::Downloading
                } else {
                    Phase::Processing
                };
                (percent, phase)
            }
            None => {
                let base = self.percent.max(self.profile.head);
                let (low, high) = self.profile.unknown_step;
                let percent = (base + rng.gen_range(low..high)).min(UNKNOWN_SIZE_CEILING);
                let phase = if percent > self.profile.unknown_downloading_above {
                    Phase::Downloading
                } else {
                    Phase::Processing
                };
                (percent, phase)
            }
        };

        self.percent = self.percent.max(percent);
        self.phase = self.phase.max(phase);
        self.snapshot(now)
    }

    pub fn complete(&mut self, now: Instant) -> ProgressSnapshot {
        self.real_progress = true;
        self.percent = 100.0;
        self.phase = Phase::Downloading;
        self.snapshot(now)
    }

    /// Back to idle, dropping all state. Used after completion and on errors.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.percent = 0.0;
        self.started_at = None;
        self.real_progress = false;
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: self.phase,
            percent: self.percent,
            eta: self.eta(now),
        }
    }

    /// Linear extrapolation from elapsed time: `elapsed * (100 - p) / p`.
    pub fn eta(&self, now: Instant) -> Option<Duration> {
        let started_at = self.started_at?;
        if self.percent <= MIN_ETA_PERCENT || self.percent >= 100.0 {
            return None;
        }

        let elapsed = now.saturating_duration_since(started_at).as_secs_f64();
        let remaining = elapsed * (100.0 - self.percent) / self.percent;
        Some(Duration::from_secs_f64(remaining))
    }
}
