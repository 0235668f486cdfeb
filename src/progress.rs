//! Progress bar for graph execution.

use crate::ui;
use indicatif::{ProgressBar, ProgressStyle};
use provision::{NodeOutcome, ProgressCallback};

/// Draws a bar on interactive terminals and prints one line per finished node.
///
/// Nothing is printed in quiet mode; without a TTY only the lines are printed.
pub struct BarProgress {
    bar: ProgressBar,
    quiet: bool,
    interactive: bool,
}

impl BarProgress {
    pub fn new(quiet: bool) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            quiet,
            interactive: !quiet && console::Term::stdout().is_term(),
        }
    }
}

impl ProgressCallback for BarProgress {
    fn on_run_start(&mut self, total: usize) {
        if !self.interactive {
            return;
        }
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        self.bar = bar;
    }

    fn on_node_start(&mut self, name: &str, description: &str) {
        log::debug!("Starting {name}: {description}");
        self.bar.set_message(name.to_string());
    }

    fn on_node_complete(&mut self, outcome: &NodeOutcome) {
        self.bar.inc(1);
        if self.quiet {
            return;
        }
        let line = ui::node_line(outcome);
        self.bar.suspend(|| println!("  {line}"));
    }
}

impl Drop for BarProgress {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}
