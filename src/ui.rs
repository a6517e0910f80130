use colored::*;

use crate::agent::{ToolCall, ToolStatus};

const RULE_WIDTH: usize = 60;

pub fn print_header(model: &str, vendor: &str) {
    let line = "─".repeat(RULE_WIDTH);
    eprintln!("{}", line.black().bold());

    let name = "Quill".yellow().bold();
    let version = format!("v{}", env!("CARGO_PKG_VERSION")).black().bold();
    eprintln!("  {} {}", name, version);

    let info = format!("  {}  •  {}", model, vendor).cyan();
    eprintln!("{}", info);

    eprintln!("{}", line.black().bold());
}

pub fn print_step(msg: &str) {
    eprintln!("  {} {}", "•".green(), msg);
}

pub fn print_success(msg: &str) {
    eprintln!("  {} {}", "✓".green().bold(), msg.green());
}

pub fn print_warning(msg: &str) {
    eprintln!("  {} {}", "⚠".yellow().bold(), msg.yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("  {} {}", "✗".red().bold(), msg.red());
}

/// One line describing a tool call's current status.
pub fn tool_status_line(call: &ToolCall) -> String {
    match call.status {
        ToolStatus::Pending => format!("{} {}", "∴".magenta(), call.name),
        ToolStatus::Running => format!("{} {} {}", "→".cyan(), call.name.bold(), call.args),
        ToolStatus::Success => format!("{} {}", "✓".green().bold(), call.name),
        ToolStatus::Error => format!(
            "{} {}: {}",
            "✗".red().bold(),
            call.name,
            call.error.as_deref().unwrap_or("failed").red()
        ),
    }
}

/// Tool progress goes to stderr so stdout carries only the answer.
pub fn print_tool_event(call: &ToolCall) {
    // Pending is immediately followed by running; one line is enough.
    if call.status != ToolStatus::Pending {
        eprintln!("  {}", tool_status_line(call));
    }
}
