// crates/analysisflow/src/jobs/analysis.rs

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::AnalysisOutput;

const STDERR_SNIPPET_CHARS: usize = 500;

/// Failure raised by an analyzer for one attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
}

impl ExecutionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

/// The analysis collaborator a worker calls for each job.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        document_ref: &str,
        query: &str,
    ) -> Result<AnalysisOutput, ExecutionError>;
}

/// Runs an external program as `<program> [args..] <document_ref> <query>`
/// and takes its stdout as the analysis text.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    program: String,
    args: Vec<String>,
}

impl CommandAnalyzer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a command line on whitespace. `None` if it is blank.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn analyze(
        &self,
        document_ref: &str,
        query: &str,
    ) -> Result<AnalysisOutput, ExecutionError> {
        match tokio::fs::try_exists(Path::new(document_ref)).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(ExecutionError::new(
                    ErrorCode::DocumentNotFound,
                    format!("document not found: {document_ref}"),
                ))
            }
            Err(e) => {
                return Err(ExecutionError::new(
                    ErrorCode::DependencyDown,
                    format!("cannot stat document {document_ref}: {e}"),
                ))
            }
        }

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(document_ref)
            .arg(query)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ExecutionError::new(
                    ErrorCode::DependencyDown,
                    format!("failed to run {}: {e}", self.program),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let snippet: String = stderr.trim().chars().take(STDERR_SNIPPET_CHARS).collect();
            return Err(ExecutionError::new(
                ErrorCode::DependencyDown,
                format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status.code().map_or("signal".to_string(), |c| c.to_string()),
                    snippet
                ),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(ExecutionError::new(
                ErrorCode::BadDocument,
                format!("analysis produced no output for {document_ref}"),
            ));
        }

        Ok(AnalysisOutput::new(text)
            .with_meta("program", self.program.clone())
            .with_meta("exit_code", output.status.code().unwrap_or(0))
            .with_meta("document_ref", document_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_splits_program_and_args() {
        let a = CommandAnalyzer::from_command_line("  python3 analyze.py --fast ").unwrap();
        assert_eq!(a.program(), "python3");
        assert_eq!(a.args, vec!["analyze.py", "--fast"]);
        assert!(CommandAnalyzer::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn missing_document_is_not_retryable() {
        let a = CommandAnalyzer::new("cat", vec![]);
        let err = a
            .analyze("/definitely/not/here.pdf", "summary")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DocumentNotFound);
        assert!(!err.is_retryable());
    }
}
