//! Status symbols and one-line status messages.

use owo_colors::OwoColorize;
use wsrun_core::TargetState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
    Warning,
    Skipped,
}

impl Status {
    pub fn symbol(&self) -> &'static str {
        match self {
            Status::Success => "✓",
            Status::Error => "✗",
            Status::Warning => "⚠",
            Status::Skipped => "⊘",
        }
    }

    fn format(&self, message: &str) -> String {
        match self {
            Status::Success => format!("{} {}", self.symbol().green(), message.green().bold()),
            Status::Error => format!("{} {}", self.symbol().red(), message.red().bold()),
            Status::Warning => format!("{} {}", self.symbol().yellow(), message.yellow().bold()),
            Status::Skipped => format!("{} {}", self.symbol().bright_black(), message.bright_black()),
        }
    }
}

impl From<TargetState> for Status {
    fn from(state: TargetState) -> Self {
        match state {
            TargetState::Done => Status::Success,
            TargetState::Skipped => Status::Skipped,
            TargetState::Failed => Status::Error,
            _ => Status::Warning,
        }
    }
}

pub fn print_success(message: &str) {
    println!("  {}", Status::Success.format(message));
}

pub fn print_warning(message: &str) {
    println!("  {}", Status::Warning.format(message));
}
