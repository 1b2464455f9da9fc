//! Terminal output for chartpatch.
//!
//! Progress and summaries go to stderr with a colored status symbol, leaving
//! stdout for machine-readable output (`matrix`, `--format json`).

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream, Style};

/// How command summaries are rendered.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const ADD: &str = "+";
  pub const SKIP: &str = "-";
}

#[derive(Debug, Clone, Copy)]
enum Tone {
  Success,
  Error,
  Warning,
  Info,
}

impl Tone {
  fn symbol(self) -> &'static str {
    match self {
      Tone::Success => symbols::SUCCESS,
      Tone::Error => symbols::ERROR,
      Tone::Warning => symbols::WARNING,
      Tone::Info => symbols::INFO,
    }
  }

  fn style(self) -> Style {
    match self {
      Tone::Success => Style::new().green(),
      Tone::Error => Style::new().red(),
      Tone::Warning => Style::new().yellow(),
      Tone::Info => Style::new().blue(),
    }
  }

  /// Errors and warnings color the whole line, not only the symbol.
  fn colors_message(self) -> bool {
    matches!(self, Tone::Error | Tone::Warning)
  }
}

fn status(tone: Tone, message: &str) {
  let style = tone.style();
  let message_style = if tone.colors_message() { style } else { Style::new() };
  eprintln!(
    "{} {}",
    tone.symbol().if_supports_color(Stream::Stderr, |s| s.style(style)),
    message.if_supports_color(Stream::Stderr, |s| s.style(message_style))
  );
}

pub fn print_success(message: &str) {
  status(Tone::Success, message);
}

pub fn print_error(message: &str) {
  status(Tone::Error, message);
}

pub fn print_warning(message: &str) {
  status(Tone::Warning, message);
}

pub fn print_info(message: &str) {
  status(Tone::Info, message);
}

/// Indented `label: value` line under a status line.
pub fn print_stat(label: &str, value: &str) {
  eprintln!("  {}: {}", label.if_supports_color(Stream::Stderr, |s| s.dimmed()), value);
}

/// Indented `symbol from → to` line.
pub fn print_mapping(symbol: &str, from: &str, to: &str) {
  eprintln!(
    "  {} {} {} {}",
    symbol.if_supports_color(Stream::Stderr, |s| s.cyan()),
    from,
    symbols::ARROW.if_supports_color(Stream::Stderr, |s| s.dimmed()),
    to.if_supports_color(Stream::Stderr, |s| s.green())
  );
}

/// Pretty JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

/// Human-readable time since `start`, at millisecond precision.
pub fn elapsed(start: Instant) -> String {
  format_duration(start.elapsed())
}

pub fn format_duration(duration: Duration) -> String {
  let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
  humantime::format_duration(Duration::from_millis(millis)).to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn format_duration_drops_sub_millisecond_noise() {
    assert_eq!(format_duration(Duration::from_micros(50_400)), "50ms");
    assert_eq!(format_duration(Duration::from_millis(1500)), "1s 500ms");
    assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
  }

  #[test]
  fn output_format_defaults_to_text() {
    assert!(OutputFormat::Json.is_json());
    assert!(!OutputFormat::default().is_json());
  }
}
