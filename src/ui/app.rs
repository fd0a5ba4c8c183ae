//! Application state for the GPU monitor.

use crate::gpu_monitor::UsageSnapshot;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::time::Duration;

/// State shown by the monitor between refreshes.
pub struct App {
    /// Most recent successful query
    pub snapshot: Option<UsageSnapshot>,
    /// Error from the most recent query, if it failed
    pub error: Option<String>,
    pub interval: Duration,
    pub job_count: usize,
    pub refreshes: u64,
}

impl App {
    pub fn new(interval: Duration, job_count: usize) -> Self {
        Self {
            snapshot: None,
            error: None,
            interval,
            job_count,
            refreshes: 0,
        }
    }

    /// Replace the displayed data with a fresh snapshot.
    pub fn update(&mut self, snapshot: UsageSnapshot) {
        self.snapshot = Some(snapshot);
        self.error = None;
        self.refreshes += 1;
    }

    /// Keep the last good snapshot on screen and show the failure.
    pub fn set_error(&mut self, error: String) {
        self.error = Some(error);
        self.refreshes += 1;
    }

    pub fn title(&self) -> String {
        let mut title = format!(
            "Beaker GPU Monitor - {} job{}",
            self.job_count,
            if self.job_count == 1 { "" } else { "s" }
        );
        if let Some(snapshot) = &self.snapshot {
            title.push_str(&format!(" | Updated {}", snapshot.timestamp));
        }
        title.push_str(&format!(" | Every {}s", self.interval.as_secs()));
        title
    }
}

/// `q`, `Esc` or Ctrl+C.
pub fn is_quit_key(key: &KeyEvent) -> bool {
    if key.kind != KeyEventKind::Press {
        return false;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}
