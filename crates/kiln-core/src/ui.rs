use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Local, SecondsFormat, Utc};
use colored::{Color, Colorize};

use crate::secrets::SecretFilter;

/// Output sink for human and machine-readable messages.
pub trait Ui: Send + Sync {
    fn say(&self, message: &str);
    fn message(&self, message: &str);
    fn error(&self, message: &str);
    fn machine(&self, category: &str, args: &[&str]);

    /// True for the `-machine-readable` sink; color decoration is skipped for it.
    fn is_machine_readable(&self) -> bool {
        false
    }
}

pub type SharedUi = Arc<dyn Ui>;

type Sink = Mutex<Box<dyn Write + Send>>;

fn write_line(sink: &Sink, line: &str) {
    let mut w = sink.lock().unwrap_or_else(PoisonError::into_inner);
    // A closed stdout (e.g. `kiln build | head`) is not worth failing a build over.
    let _ = writeln!(w, "{line}");
    let _ = w.flush();
}

/// Plain terminal output.
pub struct BasicUi {
    out: Sink,
    err: Sink,
    secrets: Arc<SecretFilter>,
}

impl BasicUi {
    pub fn new(out: Box<dyn Write + Send>, err: Box<dyn Write + Send>, secrets: Arc<SecretFilter>) -> Self {
        Self { out: Mutex::new(out), err: Mutex::new(err), secrets }
    }

    pub fn stdio(secrets: Arc<SecretFilter>) -> Self {
        Self::new(Box::new(std::io::stdout()), Box::new(std::io::stderr()), secrets)
    }
}

impl Ui for BasicUi {
    fn say(&self, message: &str) {
        write_line(&self.out, &self.secrets.filter(message));
    }

    fn message(&self, message: &str) {
        write_line(&self.out, &self.secrets.filter(message));
    }

    fn error(&self, message: &str) {
        write_line(&self.err, &self.secrets.filter(message));
    }

    fn machine(&self, category: &str, args: &[&str]) {
        let args: Vec<String> = args.iter().map(|a| self.secrets.filter(a)).collect();
        tracing::debug!(category, args = ?args, "machine readable");
    }
}

/// `timestamp,target,type,data...` lines, one per event, on a single writer.
pub struct MachineReadableUi {
    out: Sink,
    secrets: Arc<SecretFilter>,
}

impl MachineReadableUi {
    pub fn new(out: Box<dyn Write + Send>, secrets: Arc<SecretFilter>) -> Self {
        Self { out: Mutex::new(out), secrets }
    }

    pub fn stdout(secrets: Arc<SecretFilter>) -> Self {
        Self::new(Box::new(std::io::stdout()), secrets)
    }
}

pub fn machine_escape(arg: &str) -> String {
    arg.replace(',', "%!(KILN_COMMA)").replace('\r', "\\r").replace('\n', "\\n")
}

impl Ui for MachineReadableUi {
    fn say(&self, message: &str) {
        self.machine("ui", &["say", message]);
    }

    fn message(&self, message: &str) {
        self.machine("ui", &["message", message]);
    }

    fn error(&self, message: &str) {
        self.machine("ui", &["error", message]);
    }

    fn machine(&self, category: &str, args: &[&str]) {
        let (target, category) = match category.split_once(',') {
            Some((target, rest)) => (target, rest),
            None => ("", category),
        };
        let args: Vec<String> = args.iter().map(|a| machine_escape(&self.secrets.filter(a))).collect();
        let line = format!("{},{},{},{}", Utc::now().timestamp(), target, category, args.join(","));
        tracing::trace!("{line}");
        write_line(&self.out, &line);
    }

    fn is_machine_readable(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiColor {
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
}

impl From<UiColor> for Color {
    fn from(c: UiColor) -> Self {
        match c {
            UiColor::Red => Color::Red,
            UiColor::Green => Color::Green,
            UiColor::Yellow => Color::Yellow,
            UiColor::Blue => Color::Blue,
            UiColor::Magenta => Color::Magenta,
            UiColor::Cyan => Color::Cyan,
        }
    }
}

/// Per-build palette, cycled by build index.
pub const BUILD_PALETTE: [UiColor; 5] = [UiColor::Green, UiColor::Cyan, UiColor::Magenta, UiColor::Yellow, UiColor::Blue];

pub struct ColoredUi {
    pub color: UiColor,
    pub error_color: UiColor,
    pub inner: SharedUi,
}

impl ColoredUi {
    pub fn new(color: UiColor, inner: SharedUi) -> Self {
        Self { color, error_color: UiColor::Red, inner }
    }

    fn colorize(&self, message: &str, color: UiColor, bold: bool) -> String {
        if std::env::var_os("KILN_NO_COLOR").is_some() {
            return message.to_string();
        }
        let colored = message.color(Color::from(color));
        if bold {
            colored.bold().to_string()
        } else {
            colored.to_string()
        }
    }
}

impl Ui for ColoredUi {
    fn say(&self, message: &str) {
        self.inner.say(&self.colorize(message, self.color, true));
    }

    fn message(&self, message: &str) {
        self.inner.message(&self.colorize(message, self.color, false));
    }

    fn error(&self, message: &str) {
        self.inner.error(&self.colorize(message, self.error_color, true));
    }

    fn machine(&self, category: &str, args: &[&str]) {
        self.inner.machine(category, args);
    }

    fn is_machine_readable(&self) -> bool {
        self.inner.is_machine_readable()
    }
}

/// Prefixes every line with `==> target: ` and machine categories with `target,`.
pub struct TargetedUi {
    pub target: String,
    pub inner: SharedUi,
}

impl TargetedUi {
    pub fn new(target: impl Into<String>, inner: SharedUi) -> Self {
        Self { target: target.into(), inner }
    }

    fn prefix_lines(&self, arrow: bool, message: &str) -> String {
        let arrow = if arrow { "==>" } else { "   " };
        let lines: Vec<String> = message.split('\n').map(|line| format!("{arrow} {}: {line}", self.target)).collect();
        lines.join("\n").trim_end().to_string()
    }
}

impl Ui for TargetedUi {
    fn say(&self, message: &str) {
        self.inner.say(&self.prefix_lines(true, message));
    }

    fn message(&self, message: &str) {
        self.inner.message(&self.prefix_lines(false, message));
    }

    fn error(&self, message: &str) {
        self.inner.error(&self.prefix_lines(true, message));
    }

    fn machine(&self, category: &str, args: &[&str]) {
        self.inner.machine(&format!("{},{}", self.target, category), args);
    }

    fn is_machine_readable(&self) -> bool {
        self.inner.is_machine_readable()
    }
}

pub struct TimestampedUi {
    pub inner: SharedUi,
}

impl TimestampedUi {
    pub fn new(inner: SharedUi) -> Self {
        Self { inner }
    }

    fn stamp(message: &str) -> String {
        format!("{}: {message}", Local::now().to_rfc3339_opts(SecondsFormat::Secs, false))
    }
}

impl Ui for TimestampedUi {
    fn say(&self, message: &str) {
        self.inner.say(&Self::stamp(message));
    }

    fn message(&self, message: &str) {
        self.inner.message(&Self::stamp(message));
    }

    fn error(&self, message: &str) {
        self.inner.error(&Self::stamp(message));
    }

    fn machine(&self, category: &str, args: &[&str]) {
        self.inner.machine(category, args);
    }

    fn is_machine_readable(&self) -> bool {
        self.inner.is_machine_readable()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UiEvent {
    Say(String),
    Message(String),
    Error(String),
    Machine(String, Vec<String>),
}

/// Captures everything written to it. Used by tests and dry runs.
#[derive(Default)]
pub struct RecordingUi {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn said(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Say(s) | UiEvent::Message(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Error(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn machine_lines(&self) -> Vec<(String, Vec<String>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Machine(c, a) => Some((c, a)),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.said().iter().chain(self.errors().iter()).any(|l| l.contains(needle))
    }

    fn push(&self, e: UiEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(e);
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.push(UiEvent::Say(message.to_string()));
    }

    fn message(&self, message: &str) {
        self.push(UiEvent::Message(message.to_string()));
    }

    fn error(&self, message: &str) {
        self.push(UiEvent::Error(message.to_string()));
    }

    fn machine(&self, category: &str, args: &[&str]) {
        self.push(UiEvent::Machine(category.to_string(), args.iter().map(|a| a.to_string()).collect()));
    }
}
