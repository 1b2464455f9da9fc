//! External program execution.
//!
//! The chart renderer, scanner, patcher and mirror are opaque external
//! programs. This module runs them with captured output and turns a non-zero
//! exit into a diagnosable error carrying stderr.

use std::io;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Maximum stderr length kept in error messages.
const STDERR_LIMIT: usize = 2000;

/// Errors that can occur when running an external program.
#[derive(Debug, Error)]
pub enum ProcessError {
  /// The command template expanded to nothing.
  #[error("empty command")]
  EmptyCommand,

  /// The program could not be started.
  #[error("failed to start {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  /// The program exited unsuccessfully.
  #[error("{program} failed with exit code {code:?}: {stderr}")]
  Failed {
    program: String,
    code: Option<i32>,
    stderr: String,
  },
}

/// Run `argv[0]` with the remaining arguments and return its trimmed stdout.
pub async fn run(argv: &[String]) -> Result<String, ProcessError> {
  let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;

  debug!(program = %program, args = ?args, "spawning process");

  let output = Command::new(program)
    .args(args)
    .output()
    .await
    .map_err(|source| ProcessError::Spawn {
      program: program.clone(),
      source,
    })?;

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stderr = truncate(&stderr, STDERR_LIMIT);
    return Err(ProcessError::Failed {
      program: program.clone(),
      code: output.status.code(),
      stderr,
    });
  }

  Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Substitute `{name}` placeholders in every template argument.
pub fn expand(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
  template
    .iter()
    .map(|arg| {
      vars
        .iter()
        .fold(arg.clone(), |acc, (name, value)| acc.replace(&format!("{{{}}}", name), value))
    })
    .collect()
}

fn truncate(text: &str, limit: usize) -> String {
  if text.len() <= limit {
    return text.to_string();
  }
  let mut end = limit;
  while !text.is_char_boundary(end) {
    end -= 1;
  }
  format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn expand_substitutes_placeholders() {
    let template = argv(&["trivy", "--output", "{output}", "{image}"]);
    let expanded = expand(&template, &[("image", "nginx:1.25"), ("output", "/tmp/r.json")]);
    assert_eq!(expanded, argv(&["trivy", "--output", "/tmp/r.json", "nginx:1.25"]));
  }

  #[test]
  fn expand_leaves_unknown_placeholders() {
    let expanded = expand(&argv(&["{unknown}"]), &[("image", "x")]);
    assert_eq!(expanded, argv(&["{unknown}"]));
  }

  #[test]
  fn truncate_respects_char_boundaries() {
    assert_eq!(truncate("héllo", 2), "h...");
    assert_eq!(truncate("short", 10), "short");
  }

  #[tokio::test]
  async fn empty_command_is_rejected() {
    assert!(matches!(run(&[]).await, Err(ProcessError::EmptyCommand)));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn captures_stdout() {
    let out = run(&argv(&["/bin/sh", "-c", "echo hello"])).await.unwrap();
    assert_eq!(out, "hello");
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn failure_carries_stderr() {
    let err = run(&argv(&["/bin/sh", "-c", "echo boom >&2; exit 3"])).await.unwrap_err();
    match err {
      ProcessError::Failed { code, stderr, .. } => {
        assert_eq!(code, Some(3));
        assert_eq!(stderr, "boom");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[tokio::test]
  async fn missing_program_fails_to_spawn() {
    let err = run(&argv(&["chartpatch-definitely-missing-binary"])).await.unwrap_err();
    assert!(matches!(err, ProcessError::Spawn { .. }));
  }
}
