//! Sandbox configuration.
//!
//! Defaults match the stock agent and proxy images. Every value can be
//! overridden from the environment (`AGS_*`) or programmatically with the
//! `with_*` setters.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Container log file the agent hooks append to.
pub const DEFAULT_LOG_FILE_NAME: &str = "ags.log";

/// Paths, image names and container wiring used by a session.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Root directory for sandbox state.
    pub home: PathBuf,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Directory holding one workspace clone per session.
    pub workspaces_dir: PathBuf,
    /// Docker build context for both images.
    pub build_context: PathBuf,
    /// Dockerfile of the agent image, relative to the build context.
    pub agent_dockerfile: PathBuf,
    /// Dockerfile of the proxy image, relative to the build context.
    pub proxy_dockerfile: PathBuf,
    pub agent_image: String,
    pub proxy_image: String,
    /// Build images even when a tag with the same name exists.
    pub rebuild_images: bool,
    pub network: String,
    pub proxy_port: u16,
    pub credentials_volume: String,
    /// Mount point of the credentials volume inside the agent container.
    pub credentials_mount: String,
    pub container_user: String,
    /// Workspace mount point and working directory inside the agent container.
    pub container_workdir: String,
    /// Directory inside the agent container where hooks write their log.
    pub container_log_dir: String,
    pub log_file_name: String,
    pub log_poll_interval: Duration,
    /// Directory inside the workspace holding the agent's settings.
    pub agent_config_dir: String,
    /// Seconds the engine waits before killing a stopped container.
    pub stop_timeout_secs: i64,
    /// How long a stop request waits for the process running the session to
    /// finalize it before collecting the result itself.
    pub stop_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ags");
        Self::with_defaults(home)
    }
}

impl SandboxConfig {
    fn with_defaults(home: PathBuf) -> Self {
        Self {
            database_path: home.join(ags_local_db::connection::DATABASE_FILE_NAME),
            workspaces_dir: home.join("worktrees"),
            home,
            build_context: PathBuf::from("."),
            agent_dockerfile: PathBuf::from("Dockerfile.agent"),
            proxy_dockerfile: PathBuf::from("Dockerfile.proxy"),
            agent_image: "claude-code-agent".to_string(),
            proxy_image: "claude-code-proxy".to_string(),
            rebuild_images: false,
            network: "agent-network".to_string(),
            proxy_port: 3128,
            credentials_volume: "claude-code-credentials".to_string(),
            credentials_mount: "/home/node/.claude".to_string(),
            container_user: "node".to_string(),
            container_workdir: "/workspace".to_string(),
            container_log_dir: "/var/log".to_string(),
            log_file_name: DEFAULT_LOG_FILE_NAME.to_string(),
            log_poll_interval: Duration::from_millis(50),
            agent_config_dir: ".claude".to_string(),
            stop_timeout_secs: 10,
            stop_grace: Duration::from_secs(15),
        }
    }

    /// Build the configuration from `AGS_*` environment variables on top of the defaults.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = match std::env::var("AGS_HOME") {
            Ok(home) if !home.is_empty() => Self::with_defaults(PathBuf::from(home)),
            _ => Self::default(),
        };

        if let Ok(context) = std::env::var("AGS_BUILD_CONTEXT") {
            config.build_context = PathBuf::from(context);
        } else if let Ok(cwd) = std::env::current_dir() {
            config.build_context = cwd;
        }
        if let Ok(image) = std::env::var("AGS_AGENT_IMAGE") {
            config.agent_image = image;
        }
        if let Ok(image) = std::env::var("AGS_PROXY_IMAGE") {
            config.proxy_image = image;
        }
        if let Ok(network) = std::env::var("AGS_NETWORK") {
            config.network = network;
        }
        if let Ok(volume) = std::env::var("AGS_CREDENTIALS_VOLUME") {
            config.credentials_volume = volume;
        }
        if let Ok(port) = std::env::var("AGS_PROXY_PORT") {
            config.proxy_port = port.parse().map_err(|_| {
                crate::Error::configuration(format!("Invalid AGS_PROXY_PORT value: {}", port))
            })?;
        }
        if let Ok(flag) = std::env::var("AGS_REBUILD_IMAGES") {
            config.rebuild_images = parse_bool(&flag).ok_or_else(|| {
                crate::Error::configuration(format!("Invalid AGS_REBUILD_IMAGES value: {}", flag))
            })?;
        }

        Ok(config)
    }

    /// Relocate the home directory along with the database and workspaces under it.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        self.database_path = home.join(ags_local_db::connection::DATABASE_FILE_NAME);
        self.workspaces_dir = home.join("worktrees");
        self.home = home;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_workspaces_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspaces_dir = dir.into();
        self
    }

    pub fn with_build_context(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_context = dir.into();
        self
    }

    pub fn with_images(mut self, agent: impl Into<String>, proxy: impl Into<String>) -> Self {
        self.agent_image = agent.into();
        self.proxy_image = proxy.into();
        self
    }

    pub fn with_rebuild_images(mut self, rebuild: bool) -> Self {
        self.rebuild_images = rebuild;
        self
    }

    pub fn with_log_poll_interval(mut self, interval: Duration) -> Self {
        self.log_poll_interval = interval;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Workspace directory of a session.
    pub fn workspace_path(&self, session: &str) -> PathBuf {
        self.workspaces_dir.join(session)
    }

    /// Absolute path of a Dockerfile, resolved against the build context.
    pub fn dockerfile_path(&self, dockerfile: &Path) -> PathBuf {
        if dockerfile.is_absolute() {
            dockerfile.to_path_buf()
        } else {
            self.build_context.join(dockerfile)
        }
    }

    /// Name of the egress proxy container of a session.
    pub fn proxy_container_name(&self, session: &str) -> String {
        format!("proxy-{}", session)
    }

    /// URL the agent uses for both HTTP and HTTPS egress.
    pub fn proxy_endpoint(&self, session: &str) -> String {
        format!("http://{}:{}", self.proxy_container_name(session), self.proxy_port)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
