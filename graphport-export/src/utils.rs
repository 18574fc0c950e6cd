use log::debug;
use std::{
    io::{self, IsTerminal, Write},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Progress bar drawn on stderr, or debug log lines when stderr is not a terminal.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    last_displayed: AtomicUsize,
    label: String,
    interactive: bool,
}

impl ProgressTracker {
    pub fn new(total: usize, label: &str) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            last_displayed: AtomicUsize::new(0),
            label: label.to_string(),
            interactive: io::stderr().is_terminal(),
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn set_current(&self, current: usize, description: Option<&str>) {
        if self.total == 0 {
            return;
        }
        let current = current.min(self.total);
        self.completed.store(current, Ordering::Relaxed);

        let percent = percent_of(current, self.total);
        let last_displayed = self.last_displayed.load(Ordering::Relaxed);
        let last_percent = percent_of(last_displayed, self.total);

        // Redraw every 1% or on key milestones
        if current == 0 || percent > last_percent || current >= self.total || current - last_displayed >= 10 {
            self.last_displayed.store(current, Ordering::Relaxed);
            let description = description.unwrap_or_default();

            if !self.interactive {
                debug!("{}: {current}/{} ({percent}%) {description}", self.label, self.total);
                return;
            }

            let bar = render_bar(current, self.total, 30);
            let mut stderr = io::stderr().lock();
            let _ = write!(
                stderr,
                "\r{}: [{bar}] {current}/{} ({percent}%): {}",
                self.label,
                self.total,
                fixed_len(description, 42)
            );
            if current >= self.total {
                let _ = writeln!(stderr);
            }
            let _ = stderr.flush();
        }
    }
}

fn percent_of(current: usize, total: usize) -> usize {
    (current * 100) / total
}

fn render_bar(current: usize, total: usize, width: usize) -> String {
    let filled = (current * width) / total;
    "█".repeat(filled) + &"░".repeat(width - filled)
}

fn fixed_len(description: &str, width: usize) -> String {
    if description.chars().count() > width {
        let mut cut: String = description.chars().take(width.saturating_sub(2)).collect();
        cut.push_str("..");
        cut
    } else {
        format!("{description:width$}")
    }
}
