use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../launchpad.example.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for Launchpad
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Parent directory of every workspace.
    ///
    /// Falls back to `<system temp dir>/launchpad` when unset.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,

    /// Host used in health-check URLs
    #[serde(default = "default_host")]
    pub host: String,

    /// Path of the health endpoint on generated servers
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Characters kept from each end of long command output
    #[serde(default = "default_output_keep_chars")]
    pub output_keep_chars: usize,

    #[serde(default)]
    pub ports: PortConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub commands: CommandConfig,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default)]
    pub manifest: ManifestConfig,
}

/// Port allocation for launched servers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Lowest port that may be assigned (inclusive)
    pub min: u16,
    /// Highest port that may be assigned (inclusive)
    pub max: u16,
    /// Skip ports that are already bound on the loopback interface
    pub check_available: bool,
    /// Random draws before giving up on the bind check
    pub max_attempts: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            min: 3001,
            max: 9999,
            check_available: true,
            max_attempts: 10,
        }
    }
}

/// Step timeouts, all in seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub install: u64,
    pub setup_command: u64,
    pub build: u64,
    /// Window for the readiness phrase to appear
    pub startup: u64,
    pub probe: u64,
    /// How long a successful run stays up before the reaper fires
    pub retention: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            install: 300,
            setup_command: 120,
            build: 300,
            startup: 30,
            probe: 5,
            retention: 300,
            stop_grace: 5,
        }
    }
}

/// Commands run by the setup pipeline and the launcher
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub install: Vec<String>,
    pub build: Vec<String>,
    /// Production start command
    pub start: Vec<String>,
    /// Environment variable that carries the assigned port
    pub port_env: String,
    /// Programs a generated setup command may invoke
    pub allowed_programs: Vec<String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            install: argv(&["npm", "install"]),
            build: argv(&["npm", "run", "build"]),
            start: argv(&["npm", "start"]),
            port_env: "PORT".to_string(),
            allowed_programs: argv(&[
                "npm", "npx", "node", "yarn", "pnpm", "tsc", "prisma", "ts-node",
            ]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Case-sensitive substrings that mark a server as ready
    pub phrases: Vec<String>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            phrases: argv(&[
                "Listening on port",
                "listening on port",
                "Server running",
                "server running",
                "Server started",
                "server started",
            ]),
        }
    }
}

/// Package manifest synthesis
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub file_name: String,
    /// Lifecycle scripts injected into every manifest
    pub scripts: BTreeMap<String, String>,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        let scripts = [
            ("build", "tsc"),
            ("dev", "ts-node src/app.ts"),
            ("start", "node dist/app.js"),
            ("test", "echo \"No tests specified\" && exit 0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            file_name: "package.json".to_string(),
            scripts,
        }
    }
}

impl Config {
    /// Create a new config from the embedded example
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory under which workspaces are allocated
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("launchpad"))
    }

    /// Health-check URL for a server listening on `port`
    pub fn health_url(&self, port: u16) -> String {
        format!("http://{}:{}{}", self.host, port, self.health_path)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.install)
    }

    pub fn setup_command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.setup_command)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.build)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.startup)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.probe)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.timeouts.retention)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.stop_grace)
    }

    /// Human-readable name of the install step, e.g. "npm install"
    pub fn install_step_name(&self) -> String {
        self.commands.install.join(" ")
    }

    /// Human-readable name of the build step, e.g. "npm run build"
    pub fn build_step_name(&self) -> String {
        self.commands.build.join(" ")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

fn default_output_keep_chars() -> usize {
    2000
}
