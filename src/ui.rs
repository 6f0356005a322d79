/// file: src/ui.rs
/// description: terminal driver that prints feed notifications as they arrive
use crate::{
    events::{EventReceiver, FeedEvent},
    formatter::{Colors, EventFormatter, OutputFormat},
};
use tracing::debug;

pub struct UIController {
    event_receiver: EventReceiver,
    formatter: EventFormatter,
    colored: bool,
    quiet_mode: bool,
    header_printed: bool,
    max_events: Option<u64>,
}

pub struct UIOptions {
    pub colored: bool,
    pub quiet: bool,
    pub max_events: u64,
}

impl UIController {
    pub fn new(event_receiver: EventReceiver, format: OutputFormat, options: UIOptions) -> Self {
        Self {
            event_receiver,
            formatter: EventFormatter::new(format, options.colored),
            colored: options.colored,
            quiet_mode: options.quiet,
            header_printed: false,
            max_events: if options.max_events == 0 {
                None
            } else {
                Some(options.max_events)
            },
        }
    }

    /// Returns when the client stops or the event limit is reached.
    pub async fn run(&mut self) {
        while let Some(event) = self.event_receiver.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
    }

    fn handle_event(&mut self, event: FeedEvent) -> bool {
        match event {
            FeedEvent::Starting => debug!("Feed client starting"),
            FeedEvent::Idle => self.print_status("IDLE", "feed disabled"),
            FeedEvent::Connecting { url, attempt } => {
                self.print_status("CONNECTING", &format!("{url} (attempt {attempt})"));
            }
            FeedEvent::Connected { session_id } => {
                self.print_status("CONNECTED", &format!("session {session_id}"));
            }
            FeedEvent::EventsMerged { fresh, .. } => {
                if !self.header_printed {
                    if let Some(header) = self.formatter.header() {
                        println!("{header}");
                    }
                    self.header_printed = true;
                }
                // fresh is newest-first; print oldest first so the log reads forward
                for event in fresh.iter().rev() {
                    self.formatter.print_event(event);
                    if let Some(max) = self.max_events
                        && self.formatter.event_count() >= max
                    {
                        self.print_status("STOPPING", &format!("printed {max} events"));
                        return false;
                    }
                }
            }
            FeedEvent::Heartbeat(heartbeat) => {
                if !self.quiet_mode {
                    println!("{}", self.formatter.format_heartbeat(&heartbeat));
                }
            }
            FeedEvent::ServerError { message } => self.print_error("SERVER ERROR", &message),
            FeedEvent::MalformedMessage { kind, reason } => {
                debug!(%kind, %reason, "Malformed message dropped");
            }
            FeedEvent::ConnectionFailed(error) => self.print_error("CONNECTION FAILED", &error),
            FeedEvent::Reconnecting { attempt, delay_ms } => {
                self.print_status(
                    "RECONNECTING",
                    &format!("attempt {attempt} in {:.1}s", delay_ms as f64 / 1000.0),
                );
            }
            FeedEvent::FallbackToPolling { reason } => {
                self.print_status("POLLING", &reason);
            }
            FeedEvent::PollFailed(error) => self.print_error("POLL FAILED", &error),
            FeedEvent::Stopping => {
                self.print_status("STOPPING", "client shutting down");
                return false;
            }
        }

        true
    }

    fn print_status(&self, status: &str, message: &str) {
        if self.quiet_mode {
            return;
        }

        let color = match status {
            "CONNECTING" | "RECONNECTING" => Colors::BRIGHT_YELLOW,
            "CONNECTED" => Colors::BRIGHT_GREEN,
            "POLLING" => Colors::BRIGHT_BLUE,
            "STOPPING" => Colors::BRIGHT_MAGENTA,
            "IDLE" => Colors::BRIGHT_CYAN,
            _ => Colors::WHITE,
        };
        if self.colored {
            println!("{}{}[{}]{} {}", Colors::BOLD, color, status, Colors::RESET, message);
        } else {
            println!("[{status}] {message}");
        }
    }

    // Errors print even in quiet mode.
    fn print_error(&self, error_type: &str, message: &str) {
        if self.colored {
            println!(
                "{}{}[{}]{} {}{}{}",
                Colors::BOLD,
                Colors::BRIGHT_RED,
                error_type,
                Colors::RESET,
                Colors::RED,
                message,
                Colors::RESET
            );
        } else {
            println!("[{error_type}] {message}");
        }
    }
}
