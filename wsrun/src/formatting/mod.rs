//! Terminal formatting for the end-of-run report.

mod headers;
mod output;
mod status;
mod tables;

pub use headers::{print_section_header, SectionStyle};
pub use output::{format_duration, print_separator_with_spacing, print_summary_box};
pub use status::{print_success, print_warning, Status};
pub use tables::print_results_table;
