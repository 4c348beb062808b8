//! Console-driven unattended installation.
//!
//! One [`ConsoleInstaller`] walks one VM from first console output to a
//! finished install: wait for the login prompt, authenticate, launch the
//! installer, answer every scripted question, then recognize the
//! completion marker and send the finishing command. Progress is an
//! explicit state machine so a failure can always say where in the
//! dialogue it happened.

use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::console::{ChannelError, ConsoleChannel};
use crate::script::{InstallScript, InstallerProfile};

/// Where an install run currently is.
///
/// The completion wait after the final response stays attributed to that
/// final step, so a marker that never appears reports the last thing the
/// dialogue was doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    /// No console traffic processed yet.
    Disconnected,
    /// Waiting for the guest's login prompt.
    AwaitingLogin,
    /// Logged in, waiting for a shell and launching the installer.
    Authenticated,
    /// Answering scripted question `.0` (zero-based).
    RunningStep(usize),
    /// Completion marker seen, finish command sent.
    Completed,
    /// Terminal failure; the cause travels in [`InstallError`].
    Failed,
}

impl std::fmt::Display for InstallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::AwaitingLogin => write!(f, "awaiting login"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::RunningStep(i) => write!(f, "running step {i}"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why an install run failed. Every variant records the state the run
/// was in, which is what an operator greps the transcript for.
#[derive(Debug, Clone, Error)]
pub enum InstallError {
    /// A prompt did not appear within its step timeout.
    #[error("timed out after {elapsed:?} waiting for {pattern:?} while {state}")]
    Timeout {
        state: InstallState,
        pattern: String,
        elapsed: Duration,
    },

    /// The console went away mid-install (VM died, bridge exited).
    #[error("console closed unexpectedly while {state}")]
    Disconnected { state: InstallState },

    /// The whole-run wall-clock budget ran out before the dialogue did.
    #[error("install budget exhausted while {state}")]
    DeadlineExceeded { state: InstallState },

    /// Console I/O failed in a way that is neither timeout nor EOF.
    #[error("console error while {state}: {message}")]
    Channel { state: InstallState, message: String },
}

/// Drives one install dialogue over one console.
pub struct ConsoleInstaller<'a> {
    script: &'a InstallScript,
    profile: &'a InstallerProfile,
    state: InstallState,
}

impl<'a> ConsoleInstaller<'a> {
    pub fn new(script: &'a InstallScript, profile: &'a InstallerProfile) -> Self {
        Self {
            script,
            profile,
            state: InstallState::Disconnected,
        }
    }

    /// State reached so far. After [`run`](Self::run) this is either
    /// `Completed` or `Failed`.
    pub fn state(&self) -> &InstallState {
        &self.state
    }

    /// Run the whole dialogue. `deadline`, when given, caps total wall
    /// clock across all waits; crossing it surfaces as
    /// [`InstallError::DeadlineExceeded`].
    ///
    /// The caller owns the console's lifecycle; this never closes it.
    pub fn run(
        &mut self,
        console: &mut dyn ConsoleChannel,
        deadline: Option<Instant>,
    ) -> Result<(), InstallError> {
        let outcome = self.drive(console, deadline);
        if outcome.is_err() {
            self.state = InstallState::Failed;
        }
        outcome
    }

    fn drive(
        &mut self,
        console: &mut dyn ConsoleChannel,
        deadline: Option<Instant>,
    ) -> Result<(), InstallError> {
        // Let the kernel and getty finish their boot chatter before the
        // first wait; matching against it is pure noise.
        thread::sleep(self.profile.boot_settle);

        self.state = InstallState::AwaitingLogin;
        self.wait(console, &self.profile.login_prompt, self.profile.login_timeout, deadline)?;
        self.send(console, &self.profile.username)?;

        self.state = InstallState::Authenticated;
        self.wait(console, &self.profile.shell_prompt, self.profile.shell_timeout, deadline)?;
        self.send(console, &self.profile.installer_command)?;

        for i in 0..self.script.len() {
            self.state = InstallState::RunningStep(i);
            let step = &self.script.steps()[i];
            self.wait(console, &step.expect, step.timeout, deadline)?;
            self.send(console, &step.response)?;
            thread::sleep(self.profile.step_settle);
        }

        // Still attributed to the last step; see InstallState docs.
        self.wait(
            console,
            &self.profile.completion_marker,
            self.profile.completion_timeout,
            deadline,
        )?;
        self.send(console, &self.profile.finish_command)?;

        self.state = InstallState::Completed;
        Ok(())
    }

    /// Expect with the step timeout capped to whatever budget remains.
    fn wait(
        &self,
        console: &mut dyn ConsoleChannel,
        pattern: &str,
        timeout: Duration,
        deadline: Option<Instant>,
    ) -> Result<String, InstallError> {
        let effective = match deadline {
            None => timeout,
            Some(d) => match d.checked_duration_since(Instant::now()) {
                Some(left) => timeout.min(left),
                None => {
                    return Err(InstallError::DeadlineExceeded {
                        state: self.state.clone(),
                    })
                }
            },
        };

        match console.expect(pattern, effective) {
            Ok(seen) => Ok(seen),
            Err(ChannelError::Timeout { pattern, elapsed }) => {
                // A capped wait that ran out of budget is a budget
                // failure, not a step failure.
                let budget_hit = deadline
                    .map(|d| effective < timeout && Instant::now() >= d)
                    .unwrap_or(false);
                if budget_hit {
                    Err(InstallError::DeadlineExceeded {
                        state: self.state.clone(),
                    })
                } else {
                    Err(InstallError::Timeout {
                        state: self.state.clone(),
                        pattern,
                        elapsed,
                    })
                }
            }
            Err(ChannelError::Closed) => Err(InstallError::Disconnected {
                state: self.state.clone(),
            }),
            Err(ChannelError::Io(e)) => Err(InstallError::Channel {
                state: self.state.clone(),
                message: e.to_string(),
            }),
        }
    }

    fn send(&self, console: &mut dyn ConsoleChannel, line: &str) -> Result<(), InstallError> {
        match console.send_line(line) {
            Ok(()) => Ok(()),
            Err(ChannelError::Closed) => Err(InstallError::Disconnected {
                state: self.state.clone(),
            }),
            Err(e) => Err(InstallError::Channel {
                state: self.state.clone(),
                message: e.to_string(),
            }),
        }
    }
}
