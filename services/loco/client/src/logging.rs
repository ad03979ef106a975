//! Log formatting.
//!
//! Lines look like `[timestamp] [component] [level] message`. Events carrying
//! a `component` field (see [`component_info!`](crate::component_info)) are
//! labelled `loco-<component>`, everything else `loco`.

use std::fmt;
use std::io::IsTerminal;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 16;
const LOG_LEVEL_WIDTH: usize = 5;

/// Crates whose targets follow the configured level
const LOCO_TARGETS: [&str; 5] = ["loco", "loco_wire", "loco_session", "loco_booking", "loco_trailer"];

/// Log with a `component` field at info level
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log with a `component` field at warn level
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log with a `component` field at debug level
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Log with a `component` field at error level
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Event formatter for client logs
pub struct LocoLogFormatter {
    name: String,
    color_enabled: bool,
}

impl LocoLogFormatter {
    /// Formatter labelling untagged events with `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color_enabled: color_supported(),
        }
    }

    /// Disable ANSI colors
    pub fn without_color(mut self) -> Self {
        self.color_enabled = false;
        self
    }

    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.name, comp),
            None => self.name.clone(),
        };
        if name.chars().count() > COMPONENT_WIDTH {
            let cut: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_level(level: &tracing::Level) -> String {
        format!("{:<width$}", level.as_str(), width = LOG_LEVEL_WIDTH)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn render(&self, level: &tracing::Level, fields: &FieldVisitor, timestamp: &str) -> String {
        let color = self.color_for_level(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };
        format!(
            "{}[{}] [{}] [{}{}{}] {}{}",
            cyan,
            timestamp,
            self.format_component(fields.component.as_deref()),
            color,
            Self::format_level(level),
            reset,
            fields.message,
            reset
        )
    }
}

impl<S, N> FormatEvent<S, N> for LocoLogFormatter
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
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        writeln!(
            writer,
            "{}",
            self.render(event.metadata().level(), &visitor, &timestamp)
        )
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

fn unquote(value: String) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => value,
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = unquote(format!("{:?}", value)),
            "component" => self.component = Some(unquote(format!("{:?}", value))),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}

fn color_supported() -> bool {
    if std::env::var("TERM").unwrap_or_default() == "dumb" {
        return false;
    }
    std::io::stdout().is_terminal()
}

/// Filter at `info` for everything, `level` for the LOCO crates
pub fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::new("info");
    for target in LOCO_TARGETS {
        filter = filter.add_directive(format!("{}={}", target, level).parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber
pub fn init(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level)?)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(LocoLogFormatter::new("loco"))
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging already initialized: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_label() {
        let formatter = LocoLogFormatter::new("loco").without_color();
        assert_eq!(formatter.format_component(None), format!("{:<16}", "loco"));
        assert_eq!(
            formatter.format_component(Some("session")),
            format!("{:<16}", "loco-session")
        );
        let long = formatter.format_component(Some("reconnector-supervisor"));
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_render_line() {
        let formatter = LocoLogFormatter::new("loco").without_color();
        let fields = FieldVisitor {
            message: "Session ready".into(),
            component: Some("session".into()),
        };
        let line = formatter.render(&tracing::Level::WARN, &fields, "2024-01-01 00:00:00.000");
        assert_eq!(
            line,
            "[2024-01-01 00:00:00.000] [loco-session    ] [WARN ] Session ready"
        );
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"x\"".into()), "x");
        assert_eq!(unquote("x".into()), "x");
    }

    #[test]
    fn test_env_filter_covers_loco_crates() {
        let filter = env_filter("debug").unwrap().to_string();
        for target in LOCO_TARGETS {
            assert!(filter.contains(&format!("{}=debug", target)));
        }
    }
}
