//! Table formatting using comfy-table.

use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use wsrun_core::{FailureCause, RunRecord, TargetState};

use super::{format_duration, Status};

fn status_color(state: TargetState) -> Color {
    match state {
        TargetState::Done => Color::Green,
        TargetState::Failed => Color::Red,
        _ => Color::DarkGrey,
    }
}

fn details(record: &RunRecord) -> String {
    match &record.cause {
        Some(FailureCause::ExitCode) => "non-zero exit".to_string(),
        Some(FailureCause::Invocation { message }) => message.clone(),
        Some(FailureCause::Dependency { dependency }) => format!("{} failed", dependency),
        Some(FailureCause::Aborted) => "aborted".to_string(),
        None if record.state == TargetState::Skipped => "up to date".to_string(),
        None => String::new(),
    }
}

/// Builds the results table. Packages that don't declare the script and
/// succeeded as no-ops are left out.
pub fn results_table(records: &[RunRecord]) -> Table {
    let mut table = Table::new();
    table
        .set_header(vec![
            Cell::new("Status").add_attribute(Attribute::Bold),
            Cell::new("Package").add_attribute(Attribute::Bold),
            Cell::new("Exit").add_attribute(Attribute::Bold),
            Cell::new("Duration").add_attribute(Attribute::Bold),
            Cell::new("Details").add_attribute(Attribute::Bold),
        ])
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    for record in records {
        if record.state == TargetState::Done && !record.executed {
            continue;
        }
        let color = status_color(record.state);
        let exit = record
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_default();
        let duration = record.elapsed.map(format_duration).unwrap_or_default();
        table.add_row(vec![
            Cell::new(Status::from(record.state).symbol()).fg(color),
            Cell::new(&record.name).fg(if record.state == TargetState::Failed {
                Color::Red
            } else {
                Color::White
            }),
            Cell::new(exit).fg(color),
            Cell::new(duration),
            Cell::new(details(record)).fg(color),
        ]);
    }

    table
}

pub fn print_results_table(records: &[RunRecord]) {
    println!("{}", results_table(records));
}
