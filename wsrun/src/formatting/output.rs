//! General output helpers.

use std::time::Duration;

use owo_colors::OwoColorize;

pub fn print_separator_with_spacing() {
    println!();
    println!("{}", "─".repeat(60).bright_black());
    println!();
}

/// Prints `items` as aligned key/value rows inside a titled box.
pub fn print_summary_box(title: &str, items: &[(&str, String)]) {
    let width = items.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    println!("┌─ {} {}", title.cyan().bold(), "─".repeat(50).bright_black());
    for (key, value) in items {
        println!(
            "│ {} {}",
            format!("{:<width$}", key, width = width).bright_black().bold(),
            value.bold().white()
        );
    }
    println!("└{}", "─".repeat(60).bright_black());
}

/// Formats a duration as `850ms`, `3.20s` or `2m 5.0s`.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds < 1.0 {
        format!("{:.0}ms", seconds * 1000.0)
    } else if seconds < 60.0 {
        format!("{:.2}s", seconds)
    } else {
        let mins = (seconds / 60.0) as u64;
        let secs = seconds % 60.0;
        format!("{}m {:.1}s", mins, secs)
    }
}
