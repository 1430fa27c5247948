//! Instance domain model.
//!
//! An [`Instance`] is one supervised game-server process: its identity,
//! launch configuration, and last observed lifecycle state. The record is
//! owned by the supervisor while the process is live; a durable store keeps
//! it between runs (out of scope here, see [`crate::store::InstanceStore`]).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a supervised instance.
///
/// Transitions are driven by the supervisor and the health daemon:
/// `Stopped → Starting → Running → {Stopping → Stopped | Crashed}`.
/// `Crashed → Starting` only happens through the bounded auto-restart
/// policy or a manual start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Not running and not expected to be.
    Stopped,
    /// Spawn issued, process not yet confirmed running.
    Starting,
    /// Process is alive and under supervision.
    Running,
    /// Graceful shutdown in progress.
    Stopping,
    /// Process exited unexpectedly.
    Crashed,
}

/// How to build the child process command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LaunchSpec {
    /// Managed Java server: interpreter + memory flags + extra args + jar.
    Jar {
        /// Path to the `java` executable.
        java_path: PathBuf,
        /// Path to the server jar.
        jar_path: PathBuf,
        /// Initial heap size in MiB (`-Xms`).
        memory_min_mb: u32,
        /// Maximum heap size in MiB (`-Xmx`).
        memory_max_mb: u32,
        /// Additional JVM/server arguments inserted before `-jar`.
        extra_args: Vec<String>,
    },
    /// Verbatim command line, split on whitespace.
    Custom {
        /// Full command line including the program name.
        command_line: String,
    },
}

impl LaunchSpec {
    /// Build the argv for this spec: program followed by arguments.
    ///
    /// Returns `None` when no program name can be produced
    /// (empty custom command line).
    #[must_use]
    pub fn argv(&self) -> Option<(String, Vec<String>)> {
        match self {
            Self::Jar {
                java_path,
                jar_path,
                memory_min_mb,
                memory_max_mb,
                extra_args,
            } => {
                let mut args = vec![
                    format!("-Xms{memory_min_mb}M"),
                    format!("-Xmx{memory_max_mb}M"),
                ];
                args.extend(extra_args.iter().cloned());
                args.push("-jar".to_string());
                args.push(jar_path.display().to_string());
                Some((java_path.display().to_string(), args))
            }
            Self::Custom { command_line } => {
                let mut parts = command_line.split_whitespace().map(String::from);
                let program = parts.next()?;
                Some((program, parts.collect()))
            }
        }
    }

    /// Whether this instance understands a domain `stop` command on stdin.
    ///
    /// Jar servers are managed: graceful shutdown goes through the console.
    /// Custom processes get an OS terminate signal instead.
    #[must_use]
    pub const fn accepts_console_stop(&self) -> bool {
        matches!(self, Self::Jar { .. })
    }
}

/// Point-in-time resource usage of a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// CPU usage in percent of one core.
    pub cpu_percent: f32,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// Unix timestamp in milliseconds when the sample was taken.
    pub sampled_at_ms: u64,
}

/// One supervised game-server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Unique instance identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// How to launch the child process.
    pub launch: LaunchSpec,
    /// Working directory the process is spawned in.
    pub working_dir: PathBuf,
    /// Last observed lifecycle status.
    pub status: InstanceStatus,
    /// OS process ID while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Whether the daemon should restart this instance after a crash.
    pub auto_restart: bool,
    /// Upper bound on consecutive auto-restart attempts.
    pub max_restart_attempts: u32,
    /// Consecutive auto-restart attempts so far.
    pub restart_attempts: u32,
    /// Unix timestamp in milliseconds of the last crash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_crash_ms: Option<u64>,
    /// Last resource usage sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSnapshot>,
}

impl Instance {
    /// Create a stopped instance with default supervision settings.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        launch: LaunchSpec,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            launch,
            working_dir,
            status: InstanceStatus::Stopped,
            pid: None,
            auto_restart: false,
            max_restart_attempts: 3,
            restart_attempts: 0,
            last_crash_ms: None,
            resources: None,
        }
    }

    /// Enable auto-restart with the given attempt bound.
    #[must_use]
    pub const fn with_auto_restart(mut self, max_attempts: u32) -> Self {
        self.auto_restart = true;
        self.max_restart_attempts = max_attempts;
        self
    }
}

/// Current time as Unix milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jar_argv_orders_memory_flags_before_jar() {
        let spec = LaunchSpec::Jar {
            java_path: PathBuf::from("/usr/bin/java"),
            jar_path: PathBuf::from("server.jar"),
            memory_min_mb: 512,
            memory_max_mb: 2048,
            extra_args: vec!["-Dfile.encoding=UTF-8".to_string()],
        };

        let (program, args) = spec.argv().unwrap();
        assert_eq!(program, "/usr/bin/java");
        assert_eq!(
            args,
            vec![
                "-Xms512M",
                "-Xmx2048M",
                "-Dfile.encoding=UTF-8",
                "-jar",
                "server.jar"
            ]
        );
    }

    #[test]
    fn custom_argv_splits_whitespace() {
        let spec = LaunchSpec::Custom {
            command_line: "./bedrock_server --port 19132".to_string(),
        };
        let (program, args) = spec.argv().unwrap();
        assert_eq!(program, "./bedrock_server");
        assert_eq!(args, vec!["--port", "19132"]);
    }

    #[test]
    fn empty_custom_command_has_no_argv() {
        let spec = LaunchSpec::Custom {
            command_line: "   ".to_string(),
        };
        assert!(spec.argv().is_none());
    }

    #[test]
    fn console_stop_only_for_jar() {
        let jar = LaunchSpec::Jar {
            java_path: PathBuf::from("java"),
            jar_path: PathBuf::from("s.jar"),
            memory_min_mb: 256,
            memory_max_mb: 256,
            extra_args: vec![],
        };
        let custom = LaunchSpec::Custom {
            command_line: "./srv".to_string(),
        };
        assert!(jar.accepts_console_stop());
        assert!(!custom.accepts_console_stop());
    }
}
