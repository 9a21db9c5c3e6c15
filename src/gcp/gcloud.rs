//! Local `gcloud` CLI execution.
//!
//! Commands are always spawned directly with an argument vector; nothing is
//! ever passed through a shell. Free-form input from HTTP clients must go
//! through [`AllowedCommand::parse`] first.

use regex::Regex;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Read-only command groups accepted from free-form input.
const ALLOWED_PREFIXES: &[&[&str]] = &[
    &["projects", "list"],
    &["projects", "describe"],
    &["run", "services", "list"],
    &["run", "services", "describe"],
    &["run", "revisions", "list"],
    &["logging", "read"],
    &["compute", "instances", "list"],
    &["compute", "addresses", "list"],
    &["billing", "accounts", "list"],
    &["recommender", "recommendations", "list"],
];

/// Flags that would let input escape the read-only contract.
const FORBIDDEN_FLAGS: &[&str] = &[
    "--flags-file",
    "--impersonate-service-account",
    "--access-token-file",
    "--configuration",
];

fn metacharacters() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[;|&$`\\\r\n]").expect("metacharacter pattern is valid"))
}

/// Captured process output.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout as JSON when it parses, otherwise the raw text.
    pub fn parsed(&self) -> Value {
        serde_json::from_str(&self.stdout).unwrap_or_else(|_| Value::String(self.stdout.clone()))
    }
}

/// Spawns the `gcloud` binary.
#[derive(Debug, Clone)]
pub struct GcloudRunner {
    program: PathBuf,
}

impl Default for GcloudRunner {
    fn default() -> Self {
        Self::new("gcloud")
    }
}

impl GcloudRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run with `args` (without the leading `gcloud`). Non-zero exit is an error.
    pub async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        debug!("Running {} {}", self.program.display(), args.join(" "));

        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::CommandFailed(format!("cannot start {}: {}", self.program.display(), e))
            })?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.status.success() {
            warn!("gcloud exited with {}: {}", output.status, result.stderr.trim());
            return Err(Error::CommandFailed(result.stderr.trim().to_string()));
        }
        Ok(result)
    }

    /// Run and decode stdout as JSON (falls back to a string).
    pub async fn run_json(&self, args: &[String]) -> Result<Value> {
        Ok(self.run(args).await?.parsed())
    }
}

/// A `gcloud` invocation that passed the allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedCommand {
    args: Vec<String>,
}

impl AllowedCommand {
    /// Validate free-form input such as `gcloud run services list --format=json`.
    pub fn parse(input: &str) -> Result<Self> {
        if metacharacters().is_match(input) {
            return Err(Error::CommandRejected(
                "shell metacharacters are not allowed".to_string(),
            ));
        }

        let mut tokens = tokenize(input)?.into_iter();
        match tokens.next() {
            Some(first) if first == "gcloud" => {}
            _ => {
                return Err(Error::CommandRejected(
                    "Only gcloud commands allowed".to_string(),
                ))
            }
        }
        let args: Vec<String> = tokens.collect();

        if let Some(flag) = args.iter().find(|arg| {
            FORBIDDEN_FLAGS
                .iter()
                .any(|f| arg.as_str() == *f || arg.starts_with(&format!("{}=", f)))
        }) {
            return Err(Error::CommandRejected(format!("flag {} is not allowed", flag)));
        }

        let words: Vec<&str> = args
            .iter()
            .map(String::as_str)
            .take_while(|arg| !arg.starts_with('-'))
            .collect();
        let allowed = ALLOWED_PREFIXES
            .iter()
            .any(|prefix| words.len() >= prefix.len() && words[..prefix.len()] == **prefix);
        if !allowed {
            return Err(Error::CommandRejected(format!(
                "gcloud {} is not an allowed command",
                words.join(" ")
            )));
        }

        Ok(Self { args })
    }

    /// Arguments after `gcloud`.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Whitespace split honouring single and double quotes.
fn tokenize(input: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err(Error::CommandRejected("unterminated quote".to_string()));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_quotes() {
        let tokens =
            tokenize(r#"gcloud logging read "resource.type=cloud_run_revision AND severity>=ERROR" --limit 5"#)
                .unwrap();
        assert_eq!(
            tokens,
            vec![
                "gcloud",
                "logging",
                "read",
                "resource.type=cloud_run_revision AND severity>=ERROR",
                "--limit",
                "5"
            ]
        );
        assert!(tokenize("gcloud 'open").is_err());
    }

    #[test]
    fn test_allows_read_only_commands() {
        let cmd = AllowedCommand::parse("gcloud run services list --format=json").unwrap();
        assert_eq!(cmd.args(), &["run", "services", "list", "--format=json"]);

        assert!(AllowedCommand::parse("gcloud projects list").is_ok());
        assert!(AllowedCommand::parse("  gcloud compute addresses list --filter=status:RESERVED").is_ok());
    }

    #[test]
    fn test_rejects_non_gcloud() {
        assert!(AllowedCommand::parse("rm -rf /").is_err());
        assert!(AllowedCommand::parse("gcloudx projects list").is_err());
        assert!(AllowedCommand::parse("").is_err());
    }

    #[test]
    fn test_rejects_prefix_bypass() {
        for input in [
            "gcloud projects list; rm -rf /",
            "gcloud projects list && curl evil",
            "gcloud projects list | sh",
            "gcloud projects list `id`",
            "gcloud projects list $(id)",
            "gcloud projects list\nrm -rf /",
        ] {
            let err = AllowedCommand::parse(input).unwrap_err();
            assert!(matches!(err, Error::CommandRejected(_)), "{input}");
        }
    }

    #[test]
    fn test_rejects_mutating_commands_and_flags() {
        assert!(AllowedCommand::parse("gcloud projects delete my-project").is_err());
        assert!(AllowedCommand::parse("gcloud run deploy svc --image x").is_err());
        assert!(AllowedCommand::parse("gcloud run services list --flags-file=/etc/passwd").is_err());
        assert!(AllowedCommand::parse("gcloud --verbosity debug projects list").is_err());
    }

    #[test]
    fn test_command_output_parsing() {
        let json = CommandOutput {
            stdout: r#"[{"name":"svc"}]"#.to_string(),
            stderr: String::new(),
        };
        assert!(json.parsed().is_array());

        let text = CommandOutput {
            stdout: "Listed 0 items.".to_string(),
            stderr: String::new(),
        };
        assert_eq!(text.parsed(), Value::String("Listed 0 items.".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_command_failure() {
        let runner = GcloudRunner::new("/nonexistent/gcloud");
        let err = runner.run(&["projects".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed(_)));
    }
}
