use std::time::Duration;

use tokio::time::Instant;

/// Elapsed call time. Runs from the first time the call is usable until
/// teardown.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallTimer {
    started_at: Option<Instant>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the timer unless it is already running.
    pub fn start(&mut self) -> bool {
        if self.started_at.is_some() {
            return false;
        }
        self.started_at = Some(Instant::now());
        true
    }

    /// Stops and resets; returns the final duration if it was running.
    pub fn stop(&mut self) -> Option<Duration> {
        self.started_at.take().map(|started| started.elapsed())
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }
}

/// `MM:SS`, or `H:MM:SS` once the call passes an hour.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}
