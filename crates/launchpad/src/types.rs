use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single external command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command exited with status 0
    pub success: bool,

    /// Captured standard output
    pub stdout: String,

    /// Captured standard error
    pub stderr: String,

    /// Why the command failed (spawn error, timeout, non-zero exit)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Exit code if the process exited normally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl CommandResult {
    /// Message for a timed-out command
    pub const TIMEOUT: &'static str = "timeout";

    /// Result for a command that exited with `exit_code`
    pub fn from_exit(exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        if exit_code == Some(0) {
            return Self {
                success: true,
                stdout,
                stderr,
                error: None,
                exit_code,
            };
        }

        let error = if stderr.trim().is_empty() {
            match exit_code {
                Some(code) => format!("exited with code {code}"),
                None => "terminated by signal".to_string(),
            }
        } else {
            stderr.clone()
        };

        Self {
            success: false,
            stdout,
            stderr,
            error: Some(error),
            exit_code,
        }
    }

    /// Result for a command that never ran
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(message.into()),
            exit_code: None,
        }
    }

    /// Result for a command killed after its timeout elapsed
    pub fn timed_out(stdout: String, stderr: String) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            error: Some(Self::TIMEOUT.to_string()),
            exit_code: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(Self::TIMEOUT)
    }

    /// Text to show for this result
    ///
    /// Stdout for successes. For failures, whatever the command printed
    /// (compilers such as tsc report on stdout), or the error message when it
    /// printed nothing.
    pub fn diagnostic(&self) -> String {
        if self.success {
            return self.stdout.clone();
        }

        let printed: Vec<&str> = [self.stdout.trim_end(), self.stderr.trim_end()]
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .collect();
        if printed.is_empty() {
            self.error.clone().unwrap_or_default()
        } else {
            printed.join("\n")
        }
    }

    /// Copy with stdout/stderr truncated to `keep` characters at each end
    pub fn truncated(&self, keep: usize) -> Self {
        Self {
            success: self.success,
            stdout: truncate_output(&self.stdout, keep),
            stderr: truncate_output(&self.stderr, keep),
            error: self.error.as_deref().map(|e| truncate_output(e, keep)),
            exit_code: self.exit_code,
        }
    }
}

/// Keep the first and last `keep` characters of `text`.
///
/// Text of at most `2 * keep` characters is returned unchanged.
pub fn truncate_output(text: &str, keep: usize) -> String {
    let total = text.chars().count();
    if total <= keep.saturating_mul(2) {
        return text.to_string();
    }

    let head: String = text.chars().take(keep).collect();
    let tail: String = text.chars().skip(total - keep).collect();
    let dropped = total - 2 * keep;
    format!("{head}\n... [{dropped} characters truncated] ...\n{tail}")
}

/// Result of a liveness probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub success: bool,

    /// Decoded response body (JSON if it parsed, otherwise the raw text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(body: serde_json::Value) -> Self {
        Self {
            success: true,
            body: Some(body),
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            success: false,
            body: None,
            error: Some(error.into()),
        }
    }
}

/// A pipeline step and the command result it produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// Step name, e.g. "npm install" or "setup: npx prisma generate"
    pub name: String,

    /// Free-form category (install, setup category label, build)
    pub category: String,

    pub result: CommandResult,
}

/// Result of the Run operation
///
/// Always JSON-serializable; failures name the failing step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub success: bool,

    pub project_id: String,

    /// Failing step ("npm install", "npm run build", "server start", ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Raw diagnostic text from the failing step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_output: Option<String>,

    /// Probe taken right after launch; a failure here is only a warning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckResult>,

    /// Non-fatal problems (skipped files, failed setup commands, probe failure)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// Every step that ran, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub(crate) fn failure(
        project_id: &str,
        step: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            project_id: project_id.to_string(),
            step: Some(step.into()),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Result of the Status operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,

    pub project_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Fresh probe taken when the status was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckResult>,
}

impl StatusReport {
    pub fn not_running(project_id: &str) -> Self {
        Self {
            running: false,
            project_id: project_id.to_string(),
            port: None,
            health_check_url: None,
            started_at: None,
            health: None,
        }
    }
}
