//! Runtime configuration from the environment
//!
//! All knobs arrive as `MOLT_*` environment variables set by whatever
//! launches the program; the embedder calls [`Config::from_env`] once at
//! startup. `MOLT_PIPE` is internal: it only ever appears in the
//! environment of a process image we exec'd ourselves, and names the read
//! end of the handoff pipe.

use std::env;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use thiserror::Error;

/// Exit-strategy selector (`MOLT_MODE`).
pub const ENV_MODE: &str = "MOLT_MODE";
/// Multi-bind (SO_REUSEPORT) enable flag (`MOLT_MULTI`).
pub const ENV_MULTI: &str = "MOLT_MULTI";
/// Revive-on-exit flag (`MOLT_REVIVE`).
pub const ENV_REVIVE: &str = "MOLT_REVIVE";
/// Wait-for-children flag (`MOLT_WAIT`).
pub const ENV_WAIT: &str = "MOLT_WAIT";
/// Debug-logging flag (`MOLT_DEBUG`).
pub const ENV_DEBUG: &str = "MOLT_DEBUG";
/// Path to unlink (best effort) when drain starts (`MOLT_UNLINK`).
pub const ENV_UNLINK: &str = "MOLT_UNLINK";
/// Handoff pipe descriptor, set only across our own exec (`MOLT_PIPE`).
pub const ENV_PIPE: &str = "MOLT_PIPE";

/// How the process gets replaced once a restart is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStrategy {
    /// Fork a successor immediately; the old process drains and exits.
    Fork,
    /// Drain first, then replace this process image in place.
    Exec,
}

/// Errors from environment parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown exit strategy {0:?} (expected \"fork\" or \"exec\")")]
    UnknownStrategy(String),

    #[error("{ENV_PIPE} is not a descriptor number: {0:?}")]
    BadPipeFd(String),
}

/// Parsed runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub exit_strategy: ExitStrategy,
    /// Allow several processes of the same generation to bind one address
    /// via SO_REUSEPORT.
    pub multi_bind: bool,
    /// Treat the program's own exit() as a restart request.
    pub revive: bool,
    /// Defer final termination while waitable child processes remain.
    pub wait_for_children: bool,
    /// Emit verbose lifecycle logging.
    pub debug: bool,
    /// Marker file (e.g. a pidfile) to unlink when drain starts.
    pub unlink_on_exit: Option<PathBuf>,
    /// Read end of the handoff pipe from the previous generation.
    pub inherited_pipe: Option<RawFd>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exit_strategy: ExitStrategy::Fork,
            multi_bind: false,
            revive: false,
            wait_for_children: false,
            debug: false,
            unlink_on_exit: None,
            inherited_pipe: None,
        }
    }
}

impl Config {
    /// Read configuration from the `MOLT_*` environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(mode) = nonempty(ENV_MODE) {
            config.exit_strategy = if mode.eq_ignore_ascii_case("fork") {
                ExitStrategy::Fork
            } else if mode.eq_ignore_ascii_case("exec") {
                ExitStrategy::Exec
            } else {
                return Err(ConfigError::UnknownStrategy(mode));
            };
        }

        config.multi_bind = flag(ENV_MULTI);
        config.revive = flag(ENV_REVIVE);
        config.wait_for_children = flag(ENV_WAIT);
        config.debug = flag(ENV_DEBUG);
        config.unlink_on_exit = nonempty(ENV_UNLINK).map(PathBuf::from);

        if let Some(raw) = nonempty(ENV_PIPE) {
            let fd = raw
                .parse::<RawFd>()
                .map_err(|_| ConfigError::BadPipeFd(raw))?;
            config.inherited_pipe = Some(fd);
        }

        Ok(config)
    }
}

fn nonempty(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn flag(name: &str) -> bool {
    nonempty(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutation is process-global; these tests each use their
    // own variable set and restore it, and the harness runs them in one
    // process, so keep them serialized on a lock.
    use std::sync::Mutex;
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().unwrap();
        for (k, v) in vars {
            env::set_var(k, v);
        }
        f();
        for (k, _) in vars {
            env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults() {
        with_env(&[], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.exit_strategy, ExitStrategy::Fork);
            assert!(!config.multi_bind);
            assert!(!config.revive);
            assert!(!config.wait_for_children);
            assert!(config.unlink_on_exit.is_none());
            assert!(config.inherited_pipe.is_none());
        });
    }

    #[test]
    fn test_exec_strategy_case_insensitive() {
        with_env(&[(ENV_MODE, "ExEc")], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.exit_strategy, ExitStrategy::Exec);
        });
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        with_env(&[(ENV_MODE, "sideways")], || {
            assert!(matches!(
                Config::from_env(),
                Err(ConfigError::UnknownStrategy(_))
            ));
        });
    }

    #[test]
    fn test_flags_and_pipe() {
        with_env(
            &[
                (ENV_MULTI, "TRUE"),
                (ENV_WAIT, "true"),
                (ENV_REVIVE, "yes"),
                (ENV_UNLINK, "/run/app.pid"),
                (ENV_PIPE, "17"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert!(config.multi_bind);
                assert!(config.wait_for_children);
                // Anything but "true" is off.
                assert!(!config.revive);
                assert_eq!(config.unlink_on_exit.as_deref(), Some("/run/app.pid".as_ref()));
                assert_eq!(config.inherited_pipe, Some(17));
            },
        );
    }

    #[test]
    fn test_bad_pipe_fd_rejected() {
        with_env(&[(ENV_PIPE, "not-a-number")], || {
            assert!(matches!(Config::from_env(), Err(ConfigError::BadPipeFd(_))));
        });
    }
}
