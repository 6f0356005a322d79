use crate::types::{Event, Heartbeat, Severity};

// ANSI color codes
pub struct Colors;

impl Colors {
    pub const RESET: &'static str = "\x1b[0m";
    pub const BOLD: &'static str = "\x1b[1m";
    pub const DIM: &'static str = "\x1b[2m";

    pub const RED: &'static str = "\x1b[31m";
    pub const WHITE: &'static str = "\x1b[37m";
    pub const GRAY: &'static str = "\x1b[90m";

    pub const BRIGHT_RED: &'static str = "\x1b[91m";
    pub const BRIGHT_GREEN: &'static str = "\x1b[92m";
    pub const BRIGHT_YELLOW: &'static str = "\x1b[93m";
    pub const BRIGHT_BLUE: &'static str = "\x1b[94m";
    pub const BRIGHT_MAGENTA: &'static str = "\x1b[95m";
    pub const BRIGHT_CYAN: &'static str = "\x1b[96m";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Minimal,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "minimal" => OutputFormat::Minimal,
            _ => OutputFormat::Table,
        }
    }
}

const SUMMARY_WIDTH: usize = 60;

pub struct EventFormatter {
    format: OutputFormat,
    colored: bool,
    event_count: u64,
}

impl EventFormatter {
    pub fn new(format: OutputFormat, colored: bool) -> Self {
        Self {
            format,
            colored,
            event_count: 0,
        }
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn header(&self) -> Option<String> {
        if self.format != OutputFormat::Table {
            return None;
        }
        let header = format!(
            "{:>8} │ {:<7} │ {:<8} │ {:<14} │ {:<12} │ {}",
            "ID", "SEV", "SYMBOL", "DECISION", "STAGE", "SUMMARY"
        );
        Some(self.paint(Colors::BOLD, &header))
    }

    pub fn print_event(&mut self, event: &Event) {
        self.event_count += 1;
        println!("{}", self.format_event(event));
    }

    pub fn format_event(&self, event: &Event) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
            }
            OutputFormat::Minimal => format!(
                "{} {} {} {}",
                event.event_id,
                event.severity.as_str(),
                event.symbol.as_deref().unwrap_or("-"),
                event.decision_type
            ),
            OutputFormat::Table => {
                let severity = format!("{:<7}", event.severity.as_str().to_uppercase());
                format!(
                    "{:>8} │ {} │ {:<8} │ {:<14} │ {:<12} │ {}",
                    event.event_id.to_string(),
                    self.paint(severity_color(event.severity), &severity),
                    event.symbol.as_deref().unwrap_or("-"),
                    event.decision_type,
                    event.stage,
                    truncate(&event.summary, SUMMARY_WIDTH)
                )
            }
        }
    }

    pub fn format_heartbeat(&self, heartbeat: &Heartbeat) -> String {
        let line = format!(
            "open {} · triggered {} · exited {}",
            heartbeat.open, heartbeat.triggered, heartbeat.exited
        );
        self.paint(Colors::DIM, &line)
    }

    fn paint(&self, color: &str, text: &str) -> String {
        if self.colored {
            format!("{}{}{}", color, text, Colors::RESET)
        } else {
            text.to_string()
        }
    }
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Green => Colors::BRIGHT_GREEN,
        Severity::Yellow => Colors::BRIGHT_YELLOW,
        Severity::Red => Colors::BRIGHT_RED,
        Severity::Unknown => Colors::GRAY,
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}
