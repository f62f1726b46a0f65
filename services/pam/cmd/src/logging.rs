use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SOURCE_WIDTH: usize = 20;
const LEVEL_WIDTH: usize = 9;

/// Line formatter: `[timestamp] [source] [level] message key=value...`
///
/// `source` is the service name, or `pam-<component>` when the event
/// carries a `component` field.
pub struct PamLogFormatter {
    service_name: String,
    color_enabled: bool,
}

#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

impl PamLogFormatter {
    /// Colors follow whether stderr is a terminal
    pub fn new(service_name: impl Into<String>) -> Self {
        let color_enabled = std::io::stderr().is_terminal()
            && !matches!(std::env::var("TERM").as_deref(), Ok("dumb"));
        Self::with_color(service_name, color_enabled)
    }

    pub fn with_color(service_name: impl Into<String>, color_enabled: bool) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled,
        }
    }

    fn source_column(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("pam-{}", component),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SOURCE_WIDTH {
            let truncated: String = name.chars().take(SOURCE_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SOURCE_WIDTH)
        }
    }

    fn level_column(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn paint(&self, code: &'static str) -> &'static str {
        if self.color_enabled {
            code
        } else {
            ""
        }
    }

    fn level_color(&self, level: &Level) -> &'static str {
        self.paint(match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        })
    }

    fn render(&self, timestamp: &str, level: &Level, fields: &EventFields) -> String {
        let reset = self.paint(COLOR_RESET);
        let mut line = format!(
            "{}[{}] [{}] [{}{}{}] {}",
            self.paint(COLOR_CYAN),
            timestamp,
            self.source_column(fields.component.as_deref()),
            self.level_color(level),
            Self::level_column(level),
            reset,
            fields.message,
        );
        for (key, value) in &fields.extra {
            let _ = write!(line, " {}={}", key, value);
        }
        line.push_str(reset);
        line
    }
}

impl<S, N> FormatEvent<S, N> for PamLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let mut fields = EventFields::default();
        event.record(&mut fields);
        writeln!(
            writer,
            "{}",
            self.render(&timestamp, event.metadata().level(), &fields)
        )
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        // format_args! messages arrive here, not in record_str
        let rendered = format!("{:?}", value);
        let rendered = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        self.record_str(field, &rendered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(message: &str, component: Option<&str>) -> EventFields {
        EventFields {
            message: message.to_string(),
            component: component.map(str::to_string),
            extra: Vec::new(),
        }
    }

    #[test]
    fn test_source_column_width() {
        let formatter = PamLogFormatter::with_color("pam", false);
        let plain = formatter.source_column(None);
        assert_eq!(plain.len(), SOURCE_WIDTH);
        assert!(plain.starts_with("pam "));

        assert!(formatter.source_column(Some("cli")).starts_with("pam-cli"));

        let long = formatter.source_column(Some("a-very-long-component-name"));
        assert_eq!(long.chars().count(), SOURCE_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_render_without_color() {
        let formatter = PamLogFormatter::with_color("pam", false);
        let mut event = fields("connected", Some("session"));
        event.extra.push(("attempt", "2".to_string()));

        let line = formatter.render("2026-01-01 00:00:00.000", &Level::INFO, &event);
        assert!(line.starts_with("[2026-01-01 00:00:00.000] [pam-session"));
        assert!(line.contains("[ℹ INFO"));
        assert!(line.ends_with("connected attempt=2"));
        assert!(!line.contains('\x1b'));
    }

    #[test]
    fn test_render_with_color() {
        let formatter = PamLogFormatter::with_color("pam", true);
        let line = formatter.render("ts", &Level::ERROR, &fields("boom", None));
        assert!(line.starts_with(COLOR_CYAN));
        assert!(line.contains(COLOR_BRIGHT_RED));
        assert!(line.ends_with(COLOR_RESET));
    }
}
