use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::budget::format_duration;
use crate::checkpoint::{PhaseStatus, TerminalStatus};
use crate::convergence::Verdict;
use crate::phase::PhaseClass;
use crate::ui::icons::{BROOM, CHECK, CLOCK, CROSS, LOOP, RUNNING, SKIP, SPARKLE, WARN};

/// Terminal UI for a pipeline run, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Phase bar: how many phases have finished
/// - Activity bar: spinner with the running phase and its timeout
pub struct PipelineUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    activity_bar: ProgressBar,
    verbose: bool,
}

impl PipelineUI {
    pub fn new(total_phases: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let phase_bar = multi.add(ProgressBar::new(total_phases));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phases");

        let activity_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg} {elapsed:.dim}")
            .expect("progress bar template is a valid static string");

        let activity_bar = multi.add(ProgressBar::new_spinner());
        activity_bar.set_style(activity_style);
        activity_bar.set_prefix("   Now");

        Self {
            multi,
            phase_bar,
            activity_bar,
            verbose,
        }
    }

    /// Print a line above the bars, falling back to stderr if the terminal is gone.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Advance the phase bar past phases finished in an earlier session.
    pub fn resume_from(&self, finished: u64) {
        self.phase_bar.set_position(finished);
    }

    pub fn start_phase(&self, name: &str, class: PhaseClass, timeout: Duration) {
        self.phase_bar.set_message(style(name).yellow().to_string());
        self.activity_bar.reset_elapsed();
        self.activity_bar.set_message(format!(
            "{}{} {}",
            RUNNING,
            style(name).cyan(),
            style(format!("({}, timeout {})", class, format_duration(timeout))).dim()
        ));
        self.activity_bar
            .enable_steady_tick(Duration::from_millis(100));
    }

    pub fn phase_finished(&self, name: &str, status: PhaseStatus, elapsed: Duration, detail: Option<&str>) {
        self.activity_bar.disable_steady_tick();
        let (icon, label) = match status {
            PhaseStatus::Completed => (CHECK, style(status.to_string()).green()),
            PhaseStatus::Timeout => (CLOCK, style(status.to_string()).red()),
            _ => (CROSS, style(status.to_string()).red()),
        };
        let mut line = format!(
            "  {}{} {} {}",
            icon,
            style(name).bold(),
            label,
            style(format!("in {}", format_duration(elapsed))).dim()
        );
        if let Some(detail) = detail {
            line.push_str(&format!(" {}", style(detail).dim()));
        }
        self.print_line(line);
        self.phase_bar.inc(1);
    }

    pub fn phase_skipped(&self, name: &str, reason: &str) {
        self.print_line(format!(
            "  {}{} {}",
            SKIP,
            style(name).dim(),
            style(reason).dim()
        ));
        self.phase_bar.inc(1);
    }

    pub fn warning(&self, message: &str) {
        self.print_line(format!("  {}{}", WARN, style(message).yellow()));
    }

    pub fn cleanup(&self, reclaimed: usize) {
        if self.verbose && reclaimed > 0 {
            self.print_line(format!(
                "  {}{}",
                BROOM,
                style(format!("reclaimed {} leftover resource(s)", reclaimed)).dim()
            ));
        }
    }

    pub fn convergence(&self, round: u32, max_rounds: u32, verdict: Verdict, restart_from: u64) {
        self.print_line(format!(
            "  {}Convergence round {}/{}: {}",
            LOOP,
            style(round).cyan(),
            max_rounds,
            style(verdict.to_string()).bold()
        ));
        if verdict == Verdict::Retry {
            self.phase_bar.set_position(restart_from);
        }
    }

    pub fn finish(&self, status: TerminalStatus, halt_reason: Option<&str>) {
        self.activity_bar.finish_and_clear();
        match status {
            TerminalStatus::Completed => {
                self.phase_bar
                    .finish_with_message(format!("{}{}", SPARKLE, style("completed").green().bold()));
            }
            TerminalStatus::Failed | TerminalStatus::Timeout => {
                self.phase_bar.abandon_with_message(style(status.to_string()).red().bold().to_string());
                if let Some(reason) = halt_reason {
                    self.print_line(format!("  {}{}", CROSS, style(reason).red()));
                }
            }
        }
    }
}
