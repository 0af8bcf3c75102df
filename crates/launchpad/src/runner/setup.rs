//! Install, setup and build steps
//!
//! Install and build are fail-fast. Setup commands are best-effort: a failing
//! or rejected command is logged and recorded, and the pipeline moves on.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::bundle::{GeneratedBundle, SetupCommand};
use crate::config::Config;
use crate::process::{CommandSpec, ProcessError, check_allowed, parse_command_line, run_command};
use crate::types::{CommandResult, StepReport};
use crate::workspace::Workspace;

/// Steps that ran and the warnings they produced
#[derive(Debug, Default)]
pub struct SetupReport {
    pub steps: Vec<StepReport>,
    pub warnings: Vec<String>,
}

impl SetupReport {
    fn record(&mut self, name: String, category: &str, result: &CommandResult, keep: usize) {
        self.steps.push(StepReport {
            name,
            category: category.to_string(),
            result: result.truncated(keep),
        });
    }

    /// Captured stdout of the build step, if it ran
    pub fn build_output(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.category == BUILD_CATEGORY)
            .map(|s| s.result.stdout.as_str())
    }
}

/// A fail-fast step failed
#[derive(Debug)]
pub struct SetupFailure {
    /// Name of the failing step, e.g. "npm install"
    pub step: String,
    pub result: CommandResult,
    /// Everything that ran up to and including the failure
    pub report: SetupReport,
}

const INSTALL_CATEGORY: &str = "install";
const BUILD_CATEGORY: &str = "build";

/// Run install, the declared setup commands in order, then build
#[instrument(skip_all, fields(project_id = %workspace.project_id()))]
pub async fn run_setup(
    workspace: &Workspace,
    bundle: &GeneratedBundle,
    config: &Config,
) -> Result<SetupReport, SetupFailure> {
    let keep = config.output_keep_chars;
    let mut report = SetupReport::default();

    let step = config.install_step_name();
    info!(step = %step, "installing dependencies");
    let result = run_step(
        &config.commands.install,
        workspace,
        &bundle.env,
        non_zero(config.install_timeout()),
    )
    .await;
    report.record(step.clone(), INSTALL_CATEGORY, &result, keep);
    if !result.success {
        warn!(step = %step, error = ?result.error, "install failed");
        return Err(SetupFailure {
            step,
            result,
            report,
        });
    }

    for command in bundle.ordered_setup_commands() {
        let name = format!("setup: {}", command.command);
        let category = if command.category.is_empty() {
            "setup"
        } else {
            command.category.as_str()
        };

        let result = match prepare_setup_command(command, &config.commands.allowed_programs) {
            Ok(argv) => {
                debug!(command = %command.command, order = command.order, "running setup command");
                run_step(
                    &argv,
                    workspace,
                    &bundle.env,
                    non_zero(config.setup_command_timeout()),
                )
                .await
            }
            Err(e) => CommandResult::failed(e.to_string()),
        };

        if !result.success {
            let reason = result.truncated(keep).error.unwrap_or_default();
            warn!(command = %command.command, error = %reason, "setup command failed, continuing");
            report
                .warnings
                .push(format!("setup command '{}' failed: {reason}", command.command));
        }
        report.record(name, category, &result, keep);
    }

    let step = config.build_step_name();
    info!(step = %step, "building project");
    let result = run_step(
        &config.commands.build,
        workspace,
        &bundle.env,
        non_zero(config.build_timeout()),
    )
    .await;
    report.record(step.clone(), BUILD_CATEGORY, &result, keep);
    if !result.success {
        warn!(step = %step, error = ?result.error, "build failed");
        return Err(SetupFailure {
            step,
            result,
            report,
        });
    }

    Ok(report)
}

/// Tokenize a declared setup command and check its program
pub fn prepare_setup_command(
    command: &SetupCommand,
    allowed_programs: &[String],
) -> Result<Vec<String>, ProcessError> {
    let argv = parse_command_line(&command.command)?;
    check_allowed(&argv, allowed_programs)?;
    Ok(argv)
}

async fn run_step(
    argv: &[String],
    workspace: &Workspace,
    env: &BTreeMap<String, String>,
    timeout: Option<Duration>,
) -> CommandResult {
    match CommandSpec::from_argv(argv) {
        Ok(spec) => {
            let spec = spec
                .current_dir(workspace.path())
                .envs(env.iter().map(|(k, v)| (k.clone(), v.clone())));
            run_command(&spec, timeout).await
        }
        Err(e) => CommandResult::failed(e.to_string()),
    }
}

/// A zero duration means "no timeout"
fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
