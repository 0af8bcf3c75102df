//! Run orchestration
//!
//! [`Orchestrator::run`] takes a project from its stored bundle to a live,
//! probed server: load, allocate, materialize, install/setup/build, launch,
//! probe, register, schedule the reaper. Failures never escape as `Err`; they
//! come back as a [`RunReport`] naming the step that failed, after the
//! workspace of the failed run has been removed.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, instrument, warn};

pub use crate::runner::probe::Prober;
pub use crate::runner::registry::{InstanceInfo, ProjectGuard, RunRegistry, RunningInstance};
pub use crate::runner::setup::{SetupFailure, SetupReport, prepare_setup_command, run_setup};

mod probe;
mod registry;
mod setup;

use crate::bundle::{BundleSource, validate_project_id};
use crate::config::{Config, PortConfig};
use crate::process::{CommandSpec, launch};
use crate::types::{RunReport, StatusReport, truncate_output};
use crate::workspace::{Workspace, ensure_manifest, write_files};

/// Step names reported for failures outside install and build
pub const STEP_LOAD: &str = "load bundle";
pub const STEP_WORKSPACE: &str = "workspace";
pub const STEP_MANIFEST: &str = "manifest";
pub const STEP_SERVER_START: &str = "server start";

/// Drives runs and owns the registry of running instances
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    source: Arc<dyn BundleSource>,
    registry: RunRegistry,
    prober: Prober,
}

impl Orchestrator {
    /// Create an orchestrator with an empty registry
    pub fn new(config: Config, source: Arc<dyn BundleSource>) -> Self {
        Self::with_registry(config, source, RunRegistry::new())
    }

    /// Create an orchestrator sharing an existing registry
    pub fn with_registry(
        config: Config,
        source: Arc<dyn BundleSource>,
        registry: RunRegistry,
    ) -> Self {
        let prober = Prober::new(config.probe_timeout());
        Self {
            config: Arc::new(config),
            source,
            registry,
            prober,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Run a project and leave its server up for the retention window
    ///
    /// A previous instance of the same project is stopped first.
    #[instrument(skip(self))]
    pub async fn run(&self, project_id: &str) -> RunReport {
        if let Err(e) = validate_project_id(project_id) {
            return RunReport::failure(project_id, STEP_LOAD, e.to_string());
        }

        let _guard = self.registry.lock_project(project_id).await;
        let keep = self.config.output_keep_chars;

        if let Some(previous) = self.registry.take(project_id).await {
            info!(
                generation = previous.generation(),
                port = previous.port(),
                "evicting previous instance"
            );
            previous.shutdown(self.config.stop_grace()).await;
        }

        let bundle = match self.source.load(project_id).await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(error = %e, "failed to load bundle");
                return RunReport::failure(project_id, STEP_LOAD, e.to_string());
            }
        };

        let mut workspace =
            match Workspace::allocate(self.config.scratch_root(), project_id).await {
                Ok(workspace) => workspace,
                Err(e) => {
                    warn!(error = %e, "failed to allocate workspace");
                    return RunReport::failure(project_id, STEP_WORKSPACE, e.to_string());
                }
            };

        let mut warnings = write_files(&workspace, &bundle.files).await.warnings();

        if let Err(e) = ensure_manifest(
            &workspace,
            project_id,
            &bundle.dependencies,
            &self.config.manifest,
        )
        .await
        {
            warn!(error = %e, "failed to write manifest");
            workspace.destroy().await;
            return RunReport {
                warnings,
                ..RunReport::failure(project_id, STEP_MANIFEST, e.to_string())
            };
        }

        let setup = match run_setup(&workspace, &bundle, &self.config).await {
            Ok(setup) => setup,
            Err(SetupFailure {
                step,
                result,
                report,
            }) => {
                workspace.destroy().await;
                warnings.extend(report.warnings);
                let error = if result.is_timeout() {
                    format!("{step} timed out")
                } else {
                    format!("{step} failed")
                };
                return RunReport {
                    details: Some(truncate_output(&result.diagnostic(), keep)),
                    warnings,
                    steps: report.steps,
                    ..RunReport::failure(project_id, step, error)
                };
            }
        };
        warnings.extend(setup.warnings.iter().cloned());
        let build_output = setup.build_output().map(|out| truncate_output(out, keep));

        let port = pick_port(&self.config.ports).await;
        let spec = match CommandSpec::from_argv(&self.config.commands.start) {
            Ok(spec) => spec
                .current_dir(workspace.path())
                .envs(bundle.env.iter().map(|(k, v)| (k.clone(), v.clone())))
                .env(self.config.commands.port_env.clone(), port.to_string()),
            Err(e) => {
                workspace.destroy().await;
                return RunReport::failure(project_id, STEP_SERVER_START, e.to_string());
            }
        };

        let process = match launch(
            &spec,
            port,
            &self.config.readiness.phrases,
            self.config.startup_timeout(),
        )
        .await
        {
            Ok(process) => process,
            Err(e) => {
                warn!(error = %e, port, "server failed to start");
                workspace.destroy().await;
                return RunReport {
                    details: e.output().map(|out| truncate_output(&out, keep)),
                    build_output,
                    warnings,
                    steps: setup.steps,
                    ..RunReport::failure(
                        project_id,
                        STEP_SERVER_START,
                        truncate_output(&e.to_string(), keep),
                    )
                };
            }
        };

        let health_check_url = self.config.health_url(port);
        let health = self.prober.probe(&health_check_url).await;
        if let Some(error) = health.error.as_deref().filter(|_| !health.success) {
            warn!(url = %health_check_url, error = %error, "initial health check failed");
            warnings.push(format!("health check failed: {error}"));
        }

        let generation = self.registry.next_generation();
        let mut instance =
            RunningInstance::new(process, workspace, health_check_url.clone(), generation);
        let started_at = instance.started_at();
        instance.set_reaper(self.registry.schedule_reaper(
            project_id,
            generation,
            self.config.retention(),
            self.config.stop_grace(),
        ));
        if let Some(stale) = self.registry.insert(instance).await {
            // Unreachable while the project lock is held, but never leak one
            stale.shutdown(self.config.stop_grace()).await;
        }

        info!(port, generation, url = %health_check_url, "project is running");

        RunReport {
            success: true,
            project_id: project_id.to_string(),
            port: Some(port),
            health_check_url: Some(health_check_url),
            started_at: Some(started_at),
            build_output,
            health: Some(health),
            warnings,
            steps: setup.steps,
            ..Default::default()
        }
    }

    /// Report whether a project has a registered instance, probing it if so
    #[instrument(skip(self))]
    pub async fn status(&self, project_id: &str) -> StatusReport {
        let Some(info) = self.registry.info(project_id).await else {
            return StatusReport::not_running(project_id);
        };

        let health = self.prober.probe(&info.health_check_url).await;
        StatusReport {
            running: true,
            project_id: info.project_id,
            port: Some(info.port),
            health_check_url: Some(info.health_check_url),
            started_at: Some(info.started_at),
            health: Some(health),
        }
    }

    /// Stop a project's instance right away
    ///
    /// Returns whether an instance was registered.
    #[instrument(skip(self))]
    pub async fn stop(&self, project_id: &str) -> bool {
        let _guard = self.registry.lock_project(project_id).await;
        match self.registry.take(project_id).await {
            Some(instance) => {
                instance.shutdown(self.config.stop_grace()).await;
                true
            }
            None => {
                debug!("no instance to stop");
                false
            }
        }
    }

    /// Stop every registered instance
    pub async fn shutdown(&self) {
        let ids = self.registry.project_ids().await;
        if !ids.is_empty() {
            info!(count = ids.len(), "shutting down running instances");
        }
        for id in ids {
            self.stop(&id).await;
        }
    }
}

/// Draw a port in the configured range
///
/// With `check_available` a draw is only used if the loopback port can be
/// bound; after `max_attempts` busy draws the last one is used regardless.
async fn pick_port(ports: &PortConfig) -> u16 {
    let attempts = ports.max_attempts.max(1);
    let mut port = random_port(ports.min, ports.max);

    if !ports.check_available {
        return port;
    }

    for attempt in 1..=attempts {
        if attempt > 1 {
            port = random_port(ports.min, ports.max);
        }
        if port_is_free(port).await {
            debug!(port, attempt, "assigned port");
            return port;
        }
        debug!(port, attempt, "port is busy, drawing again");
    }

    warn!(port, attempts, "no free port found, using the last draw");
    port
}

async fn port_is_free(port: u16) -> bool {
    tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .is_ok()
}

fn random_port(min: u16, max: u16) -> u16 {
    let (min, max) = if min <= max { (min, max) } else { (max, min) };
    let span = u32::from(max - min) + 1;

    let mut bytes = [0_u8; 4];
    let sample = match getrandom::getrandom(&mut bytes) {
        Ok(()) => u32::from_le_bytes(bytes),
        Err(e) => {
            warn!(error = %e, "system randomness unavailable, falling back to the clock");
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or_default()
        }
    };

    min + u16::try_from(sample % span).unwrap_or_default()
}
