//! Command dispatcher
//!
//! Runs the user command bound to a button press. Launches are fire and
//! forget: each one gets its own thread, its outcome is logged there, and
//! nothing flows back to the caller. A broken command never stalls the
//! volume path.

use std::process::{Command, Stdio};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{CommandSpec, CommandSpecs};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch {program}: {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {code:?}")]
    Exited { program: String, code: Option<i32> },
}

/// Argument vector running `line` through the platform shell.
pub fn shell_invocation(line: &str, windows: bool) -> Vec<String> {
    if windows {
        vec!["cmd.exe".into(), "/C".into(), line.into()]
    } else {
        vec!["/bin/bash".into(), "-c".into(), line.into()]
    }
}

/// Argument vector for `spec`, or `None` if there is nothing to run.
pub fn command_line(spec: &CommandSpec) -> Option<Vec<String>> {
    if spec.is_blank() {
        return None;
    }
    if spec.shell {
        let line = spec.args.join(" ");
        Some(shell_invocation(line.trim(), cfg!(windows)))
    } else {
        Some(spec.args.clone())
    }
}

/// Starts processes in the background.
pub trait Launcher: Send + Sync {
    fn launch(&self, event: usize, argv: Vec<String>);
}

/// Spawns real processes, one thread per launch.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Run `argv` to completion.
    pub fn run(argv: &[String]) -> Result<(), CommandError> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CommandError::LaunchFailed {
                program: program.clone(),
                source,
            })?;

        let status = child.wait().map_err(|source| CommandError::LaunchFailed {
            program: program.clone(),
            source,
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(CommandError::Exited {
                program: program.clone(),
                code: status.code(),
            })
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, event: usize, argv: Vec<String>) {
        let spawned = std::thread::Builder::new()
            .name(format!("command-{event}"))
            .spawn(move || match Self::run(&argv) {
                Ok(()) => debug!(event, command = ?argv, "Command finished"),
                Err(e) => warn!(event, command = ?argv, error = %e, "Command failed"),
            });

        if let Err(e) = spawned {
            warn!(event, error = %e, "Failed to start command thread");
        }
    }
}

pub struct CommandDispatcher {
    specs: CommandSpecs,
    launcher: Arc<dyn Launcher>,
}

impl CommandDispatcher {
    pub fn new(specs: CommandSpecs, launcher: Arc<dyn Launcher>) -> Self {
        Self { specs, launcher }
    }

    /// Fire the command bound to `event`, if any.
    pub fn trigger(&self, event: usize) {
        let Some(argv) = self.specs.get(event).and_then(command_line) else {
            return;
        };
        debug!(event, command = ?argv, "Launching command");
        self.launcher.launch(event, argv);
    }

    /// Swap the command table after a config reload.
    pub fn update(&mut self, specs: CommandSpecs) {
        debug!(commands = specs.len(), "Updated command table");
        self.specs = specs;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingLauncher {
        launches: Mutex<Vec<(usize, Vec<String>)>>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, event: usize, argv: Vec<String>) {
            self.launches.lock().unwrap().push((event, argv));
        }
    }

    fn dispatcher(specs: CommandSpecs) -> (CommandDispatcher, Arc<RecordingLauncher>) {
        let launcher = Arc::new(RecordingLauncher::default());
        (CommandDispatcher::new(specs, launcher.clone()), launcher)
    }

    #[test]
    fn shell_recipes() {
        assert_eq!(
            shell_invocation("say hello", false),
            vec!["/bin/bash", "-c", "say hello"]
        );
        assert_eq!(
            shell_invocation("say hello", true),
            vec!["cmd.exe", "/C", "say hello"]
        );
    }

    #[test]
    fn missing_or_blank_spec_launches_nothing() {
        let specs = [(0, CommandSpec::shell("  "))].into_iter().collect();
        let (dispatcher, launcher) = dispatcher(specs);

        dispatcher.trigger(0);
        dispatcher.trigger(2);
        assert!(launcher.launches.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn shell_spec_launches_once_through_the_shell() {
        let specs = [(1, CommandSpec::shell("say hello"))].into_iter().collect();
        let (dispatcher, launcher) = dispatcher(specs);

        dispatcher.trigger(1);
        let launches = launcher.launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        assert_eq!(
            launches[0],
            (
                1,
                vec!["/bin/bash".to_string(), "-c".into(), "say hello".into()]
            )
        );
    }

    #[test]
    fn argv_spec_is_passed_through() {
        let specs = [(3, CommandSpec::argv(["notify-send", "hi there"]))]
            .into_iter()
            .collect();
        let (dispatcher, launcher) = dispatcher(specs);

        dispatcher.trigger(3);
        assert_eq!(
            launcher.launches.lock().unwrap()[0].1,
            vec!["notify-send", "hi there"]
        );
    }

    #[test]
    fn update_swaps_the_table() {
        let (mut dispatcher, launcher) = dispatcher(CommandSpecs::new());
        dispatcher.update([(0, CommandSpec::argv(["true"]))].into_iter().collect());

        dispatcher.trigger(0);
        assert_eq!(launcher.launches.lock().unwrap().len(), 1);
    }

    #[test]
    fn launch_failure_is_reported() {
        let argv = vec!["/nonexistent/faderd-command".to_string()];
        assert!(matches!(
            ProcessLauncher::run(&argv),
            Err(CommandError::LaunchFailed { .. })
        ));

        // logged on the launch thread, never raised
        ProcessLauncher.launch(0, argv);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_reported() {
        let argv = shell_invocation("exit 3", false);
        match ProcessLauncher::run(&argv) {
            Err(CommandError::Exited { code, .. }) => assert_eq!(code, Some(3)),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(ProcessLauncher::run(&shell_invocation("true", false)).is_ok());
    }
}
