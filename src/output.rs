//! Output formatting and styling module.
//!
//! Provides a centralized interface for all terminal output: colored status
//! lines, the run progress bar and the per-class tables. Diagnostics go
//! through `tracing` instead; this module is for the operator.

use crate::engine::{EngineEvent, EventSink, RunMode, RunSummary, StepOutcome};
use crate::inventory::InventorySnapshot;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};

const PROGRESS_TEMPLATE: &str = "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Manages all CLI output with consistent styling and formatting.
///
/// This struct provides methods for:
/// - Success messages (green with ✓)
/// - Error messages (red with ✗)
/// - Warning messages (yellow with ⚠)
/// - Info messages (cyan)
/// - Progress bars for runs
/// - Per-class count tables
pub struct OutputFormatter;

impl OutputFormatter {
    /// Prints a success message in green with a checkmark.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use trapsort::output::OutputFormatter;
    /// OutputFormatter::success("All images sorted");
    /// ```
    pub fn success(message: &str) {
        println!("{} {}", "✓".green(), message);
    }

    /// Prints an error message in red with an X mark, on stderr.
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red(), message);
    }

    /// Prints a warning message in yellow with a warning symbol.
    pub fn warning(message: &str) {
        println!("{}", Self::warning_line(message));
    }

    /// Prints an info message in cyan.
    pub fn info(message: &str) {
        println!("{}", message.cyan());
    }

    pub fn plain(message: &str) {
        println!("{}", message);
    }

    /// Prints a section header.
    pub fn header(header: &str) {
        println!("\n{}", header.bold());
    }

    fn warning_line(message: &str) -> String {
        format!("{} {}", "⚠".yellow(), message)
    }

    /// Creates a progress bar for a run over `total` images.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use trapsort::output::OutputFormatter;
    /// let pb = OutputFormatter::create_progress_bar(100);
    /// pb.inc(1);
    /// pb.finish_with_message("done");
    /// ```
    pub fn create_progress_bar(total: u64) -> ProgressBar {
        let pb = ProgressBar::new(total);
        let style = ProgressStyle::with_template(PROGRESS_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░");
        pb.set_style(style);
        pb
    }

    /// Prints the per-class image counts with a total row.
    ///
    /// Classes are listed in class-index order.
    pub fn counts_table(snapshot: &InventorySnapshot) {
        Self::header("IMAGES PER CLASS");

        let width = snapshot
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(0)
            .max(5);

        println!("{:<width$} | {}", "Class".bold(), "Images".bold(), width = width);
        println!("{}", "-".repeat(width + 12));

        for (class, count) in snapshot.iter() {
            let word = if count == 1 { "image" } else { "images" };
            println!(
                "{:<width$} | {} {}",
                class,
                count.to_string().green(),
                word,
                width = width
            );
        }

        let total = snapshot.total();
        println!("{}", "-".repeat(width + 12));
        println!(
            "{:<width$} | {} {}",
            "Total".bold(),
            total.to_string().green().bold(),
            if total == 1 { "image" } else { "images" },
            width = width
        );
    }

    /// Prints the end-of-run report.
    pub fn run_summary(summary: &RunSummary) {
        Self::header("SUMMARY");
        let elapsed = summary.finished_at - summary.started_at;
        Self::plain(&format!(
            "Strategy {} sorted {} of {} images in {:.1}s",
            summary.strategy.bold(),
            summary.moved,
            summary.total,
            elapsed.num_milliseconds() as f64 / 1000.0
        ));
        if summary.fallbacks > 0 {
            Self::warning(&format!(
                "{} images sent to the empty class after a classification failure",
                summary.fallbacks
            ));
        }
        if summary.failures > 0 {
            Self::warning(&format!("{} images could not be moved", summary.failures));
        }
        Self::counts_table(&summary.snapshot);
    }
}

/// Renders engine events on the terminal.
///
/// Automatic runs get a progress bar; manual runs print one line per image.
#[derive(Default)]
pub struct ConsoleSink {
    bar: Option<ProgressBar>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn line(&self, text: &str) {
        match &self.bar {
            Some(bar) => bar.println(text),
            None => println!("{}", text),
        }
    }
}

impl EventSink for ConsoleSink {
    fn on_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Started {
                root,
                strategy,
                mode,
                total,
            } => {
                OutputFormatter::info(&format!(
                    "Sorting {} images in {} with {}",
                    total,
                    root.display(),
                    strategy
                ));
                if *mode == RunMode::Auto {
                    self.bar = Some(OutputFormatter::create_progress_bar(*total as u64));
                }
            }
            EngineEvent::Warning { image, message, .. } => {
                self.line(&OutputFormatter::warning_line(&format!(
                    "{}: {} (sent to empty)",
                    image.display(),
                    message
                )));
            }
            EngineEvent::Stepped { outcome, .. } => {
                if let StepOutcome::Skipped { image, reason } = outcome {
                    self.line(&OutputFormatter::warning_line(&format!(
                        "Skipped {}: {}",
                        image.display(),
                        reason
                    )));
                }
                match (&self.bar, outcome) {
                    (Some(bar), StepOutcome::Moved { record, .. }) => {
                        bar.inc(1);
                        bar.set_message(record.class_folder.clone());
                    }
                    (Some(bar), StepOutcome::Skipped { .. }) => bar.inc(1),
                    (None, StepOutcome::Moved { record, .. }) => {
                        println!(
                            "{} {} → {}",
                            "✓".green(),
                            record.source.display(),
                            record.class_folder.bold()
                        );
                    }
                    (None, StepOutcome::Skipped { .. }) => {}
                }
            }
            EngineEvent::Paused => {
                if let Some(bar) = &self.bar {
                    bar.set_message("paused");
                }
                self.line(&format!("{}", "Paused. Type r to resume.".yellow()));
            }
            EngineEvent::Resumed => {
                if let Some(bar) = &self.bar {
                    bar.set_message("");
                }
                self.line(&format!("{}", "Resumed.".cyan()));
            }
            EngineEvent::Stopped { cursor, total } => {
                if let Some(bar) = self.bar.take() {
                    bar.abandon_with_message("stopped");
                }
                OutputFormatter::warning(&format!("Stopped after {} of {} images", cursor, total));
            }
            EngineEvent::Completed(summary) => {
                if let Some(bar) = self.bar.take() {
                    bar.finish_and_clear();
                }
                OutputFormatter::success("All images sorted");
                OutputFormatter::run_summary(summary);
            }
        }
    }
}
