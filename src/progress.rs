//! Progress reporting and display
//!
//! The upload driver only talks to [`ProgressReporter`]; how progress is shown
//! is up to the implementation.

use std::sync::{Arc, PoisonError, RwLock};

/// Receives session-level progress.
///
/// `percent` never decreases within a session and stays below 100 until the
/// store has confirmed the upload. `status` carries human-readable notices
/// such as retries or stalls.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, percent: u8, status: Option<&str>);

    /// Clean up the display once the session is over.
    fn finish(&self) {}
}

impl<F> ProgressReporter for F
where
    F: Fn(u8, Option<&str>) + Send + Sync,
{
    fn report(&self, percent: u8, status: Option<&str>) {
        self(percent, status)
    }
}

/// A no-op reporter for when progress display is disabled.
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&self, _percent: u8, _status: Option<&str>) {}
}

/// Prints a line per 10% step and per status (for non-TTY).
pub struct SimpleReporter {
    last_step: RwLock<Option<u8>>,
    start_time: std::time::Instant,
}

impl SimpleReporter {
    pub fn new() -> Self {
        Self {
            last_step: RwLock::new(None),
            start_time: std::time::Instant::now(),
        }
    }
}

impl Default for SimpleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for SimpleReporter {
    fn report(&self, percent: u8, status: Option<&str>) {
        if let Some(status) = status {
            eprintln!("⚠️  {status}");
        }
        let step = percent / 10;
        let mut last_step = self.last_step.write().unwrap_or_else(PoisonError::into_inner);
        if *last_step != Some(step) {
            *last_step = Some(step);
            eprintln!("☁️  Uploading... {percent}%");
        }
    }

    fn finish(&self) {
        eprintln!(
            "⏱️  Duration: {:.2}s",
            self.start_time.elapsed().as_secs_f64()
        );
    }
}

/// Interactive progress bar (for TTY).
pub struct FancyReporter {
    bar: indicatif::ProgressBar,
}

impl FancyReporter {
    pub fn new() -> Self {
        let bar = indicatif::ProgressBar::new(100);
        let style = indicatif::ProgressStyle::default_bar()
            .template("☁️  {bar:40.cyan/blue} {pos:>3}% {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ");
        bar.set_style(style);
        bar.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { bar }
    }
}

impl Default for FancyReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for FancyReporter {
    fn report(&self, percent: u8, status: Option<&str>) {
        self.bar.set_position(percent.into());
        match status {
            Some(status) => self.bar.set_message(status.to_owned()),
            None if percent == 100 => self.bar.set_message("done"),
            None => {}
        }
    }

    fn finish(&self) {
        self.bar.finish();
    }
}

/// Create an appropriate reporter based on terminal capabilities.
pub fn create_reporter() -> Arc<dyn ProgressReporter> {
    if console::Term::stderr().is_term() {
        Arc::new(FancyReporter::new())
    } else {
        Arc::new(SimpleReporter::new())
    }
}
