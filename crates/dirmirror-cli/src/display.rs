//! Terminal output for the dirmirror CLI

use console::style;
use dirmirror_engine::{DispatcherSnapshot, ShutdownReport, Statistics};
use dirmirror_types::ConnectionState;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner showing the live state of the mirror
pub fn create_status_spinner(quiet: bool) -> Option<ProgressBar> {
    if quiet {
        return None;
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message("Watching for changes...");
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

/// One-line status for the spinner
pub fn status_line(
    snapshot: &DispatcherSnapshot,
    stats: &Statistics,
    state: ConnectionState,
) -> String {
    let pending = snapshot.queued + snapshot.retrying + snapshot.backlog;
    let mut line = format!(
        "{} | {} in flight, {} pending | {} mirrored",
        state, snapshot.in_flight, pending, stats.completed
    );
    if stats.dead_lettered > 0 {
        line.push_str(&format!(", {} failed", stats.dead_lettered));
    }
    line
}

/// Print the report produced by a shutdown
pub fn display_summary(report: &ShutdownReport) {
    let stats = &report.statistics;
    println!();
    println!("{}", style("Mirror Summary:").bold().underlined());
    println!("  Uploads: {}", style(stats.uploads).green());
    println!("  Deletes: {}", style(stats.deletes).green());
    println!("  Retries: {}", style(stats.retried).yellow());
    println!(
        "  Dead-lettered: {}",
        if report.dead_lettered > 0 {
            style(report.dead_lettered).red()
        } else {
            style(report.dead_lettered).green()
        }
    );
    println!(
        "  Events coalesced: {} into {}",
        style(report.coalescer.events_received).cyan(),
        style(report.coalescer.intents_released).cyan()
    );
    println!(
        "  Average latency: {}",
        style(format_duration(stats.average_latency())).blue()
    );
    println!("  Uptime: {}", style(format_duration(stats.uptime)).blue());

    if !report.dead_letters.is_empty() {
        println!();
        println!("{}", style("Failed paths:").bold().red());
        for letter in &report.dead_letters {
            println!(
                "  {} {} after {} attempts: {}",
                style("✗").red(),
                letter.intent,
                letter.attempts,
                style(&letter.error).dim()
            );
        }
    }

    if !report.abandoned.is_empty() {
        println!();
        display_warning(&format!(
            "{} changes were not mirrored before the grace period ended",
            report.abandoned.len()
        ));
        for intent in &report.abandoned {
            println!("    • {}", style(intent).dim());
        }
    }
}

/// Format duration in human-readable format
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Display a warning message with proper formatting
pub fn display_warning(message: &str) {
    println!("{} {}", style("⚠").yellow().bold(), style(message).yellow());
}

/// Display an error message with proper formatting
pub fn display_error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), style(message).red());
}

/// Display a success message with proper formatting
pub fn display_success(message: &str) {
    println!("{} {}", style("✓").green().bold(), style(message).green());
}

/// Display an info message with proper formatting
pub fn display_info(message: &str) {
    println!("{} {}", style("ℹ").blue().bold(), style(message).blue());
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Duration::from_millis(1500), "1.50s")]
    #[case(Duration::from_secs(125), "2m 5s")]
    #[case(Duration::from_secs(3725), "1h 2m 5s")]
    fn test_format_duration(#[case] duration: Duration, #[case] expected: &str) {
        assert_eq!(format_duration(duration), expected);
    }

    #[test]
    fn test_status_line() {
        let snapshot = DispatcherSnapshot {
            queued: 2,
            in_flight: 1,
            retrying: 1,
            backlog: 1,
            completed: 9,
            dead_lettered: 0,
        };
        let mut stats = Statistics {
            completed: 9,
            ..Statistics::default()
        };

        assert_eq!(
            status_line(&snapshot, &stats, ConnectionState::Ready),
            "ready | 1 in flight, 4 pending | 9 mirrored"
        );

        stats.dead_lettered = 2;
        assert!(status_line(&snapshot, &stats, ConnectionState::Degraded).ends_with(", 2 failed"));
    }
}
