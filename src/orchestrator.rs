//! Batch provisioning across a VM fleet.
//!
//! The orchestrator owns the whole run: validate the batch, resolve
//! install media, launch VMs up to the concurrency limit, drive each
//! install on its own worker thread, clean up what failed, and fold
//! everything into one [`BatchResult`]. One slow or broken VM never
//! takes the rest of the batch with it.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use colored::Colorize;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::hypervisor::{ActiveVm, HypervisorDriver, HypervisorError};
use crate::installer::{ConsoleInstaller, InstallError, InstallState};
use crate::media::{FetchError, MediaCache};
use crate::script::{InstallScript, InstallerProfile};
use crate::vm::VmDefinition;

/// How many transcript lines each result keeps for diagnostics.
const TRANSCRIPT_TAIL: usize = 40;

/// A batch that is wrong before any work starts. These are caller
/// mistakes and are rejected eagerly, with no VM touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchConfigError {
    #[error("batch contains no VM definitions")]
    EmptyBatch,
    #[error("install script has no steps")]
    EmptyScript,
    #[error("step {index} has an empty expect pattern")]
    BlankPattern { index: usize },
    #[error("a VM definition has an empty name")]
    BlankName,
    #[error("duplicate VM name {0:?} in batch")]
    DuplicateName(String),
    #[error("VM {name:?}: {field} must be positive")]
    InvalidTopology { name: String, field: &'static str },
}

/// Everything that can sink one VM's provisioning run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
    #[error(transparent)]
    Install(#[from] InstallError),
    /// The worker thread died mid-provision, most likely inside a
    /// driver implementation. The VM's true state is unknown.
    #[error("install worker panicked: {0}")]
    Panicked(String),
}

impl Serialize for ProvisionError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Per-batch knobs.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    /// Maximum simultaneously active installs. Clamped to at least 1.
    pub concurrency_limit: usize,
    /// Stop launching new VMs once any VM fails. Active installs are
    /// always allowed to finish.
    pub fail_fast: bool,
    /// Keep failed VMs (and their disks) around for inspection instead
    /// of destroying them.
    pub preserve_failed: bool,
    /// Slack added on top of the script's summed waits to form each
    /// VM's wall-clock budget.
    pub budget_slack: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            concurrency_limit: 2,
            fail_fast: false,
            preserve_failed: false,
            budget_slack: Duration::from_secs(60),
        }
    }
}

/// One VM's fate.
#[derive(Debug, Serialize)]
pub struct ProvisioningResult {
    pub name: String,
    /// `Completed`, `Failed`, or `Disconnected` for VMs the batch never
    /// launched (fail-fast stopped before their turn).
    pub final_state: InstallState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProvisionError>,
    #[serde(rename = "elapsed_secs", serialize_with = "secs_f64")]
    pub elapsed: Duration,
    /// Tail of the console transcript, newest last.
    pub transcript: Vec<String>,
}

fn secs_f64<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl ProvisioningResult {
    fn fetch_failed(name: String, error: FetchError) -> Self {
        Self {
            name,
            final_state: InstallState::Failed,
            error: Some(ProvisionError::Fetch(error)),
            elapsed: Duration::ZERO,
            transcript: Vec::new(),
        }
    }

    /// Never launched: still in the initial state, with no error of its
    /// own.
    fn skipped(name: String) -> Self {
        Self {
            name,
            final_state: InstallState::Disconnected,
            error: None,
            elapsed: Duration::ZERO,
            transcript: Vec::new(),
        }
    }
}

/// Overall batch classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Every VM completed its install.
    Success,
    /// At least one completed and at least one did not.
    PartialFailure,
    /// No VM completed.
    Failure,
}

impl std::fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::PartialFailure => write!(f, "partial failure"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Every VM's fate plus the overall classification. A batch call always
/// accounts for every definition it was given, launched or not.
#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub outcome: BatchOutcome,
    /// Keyed and ordered by VM name.
    pub results: BTreeMap<String, ProvisioningResult>,
}

impl BatchResult {
    fn new(results: BTreeMap<String, ProvisioningResult>) -> Self {
        let completed = results
            .values()
            .filter(|r| r.final_state == InstallState::Completed)
            .count();
        let outcome = if completed == results.len() {
            BatchOutcome::Success
        } else if completed > 0 {
            BatchOutcome::PartialFailure
        } else {
            BatchOutcome::Failure
        };
        Self { outcome, results }
    }

    pub fn completed(&self) -> usize {
        self.results
            .values()
            .filter(|r| r.final_state == InstallState::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.completed()
    }
}

/// Drives whole batches: one driver, one media cache, one policy.
pub struct ProvisioningOrchestrator {
    driver: Box<dyn HypervisorDriver>,
    cache: MediaCache,
    policy: BatchPolicy,
}

impl ProvisioningOrchestrator {
    pub fn new(driver: Box<dyn HypervisorDriver>, cache: MediaCache) -> Self {
        Self {
            driver,
            cache,
            policy: BatchPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Provision every VM in `definitions`, driving each one through
    /// `script` under `profile`.
    ///
    /// Media is resolved up front so a download happens at most once
    /// per distinct ref and a dead mirror is discovered before any VM
    /// boots. A VM whose medium cannot be produced fails without ever
    /// launching; the rest of the batch is untouched (unless fail-fast
    /// is set). Completed VMs are left running; failed ones are
    /// destroyed unless the policy preserves them.
    pub fn provision_batch(
        &self,
        definitions: Vec<VmDefinition>,
        script: &InstallScript,
        profile: &InstallerProfile,
    ) -> Result<BatchResult, BatchConfigError> {
        validate_batch(&definitions, script)?;

        let limit = self.policy.concurrency_limit.max(1);
        let budget = profile.wait_budget(script) + self.policy.budget_slack;

        // Sequential and before any launch. Repeated refs hit the cache.
        let resolved: Vec<Result<PathBuf, FetchError>> = definitions
            .iter()
            .map(|def| self.cache.resolve(&def.media))
            .collect();

        let mut results: BTreeMap<String, ProvisioningResult> = BTreeMap::new();
        let mut halted = false;
        let mut queue: VecDeque<(VmDefinition, PathBuf)> = VecDeque::new();

        for (def, media) in definitions.into_iter().zip(resolved) {
            match media {
                Ok(path) => queue.push_back((def, path)),
                Err(e) => {
                    if self.policy.fail_fast {
                        halted = true;
                    }
                    println!("  {} {}: {e}", "✗".red().bold(), def.name);
                    let name = def.name.clone();
                    results.insert(name.clone(), ProvisioningResult::fetch_failed(name, e));
                }
            }
        }

        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<ProvisioningResult>();
            let mut active = 0usize;

            loop {
                while !halted && active < limit {
                    let Some((def, media)) = queue.pop_front() else {
                        break;
                    };
                    let tx = tx.clone();
                    let driver = &*self.driver;
                    let preserve_failed = self.policy.preserve_failed;
                    scope.spawn(move || {
                        let name = def.name.clone();
                        let started = Instant::now();
                        // A panicking driver must still produce a result,
                        // or the receive loop below would wait forever.
                        let outcome = catch_unwind(AssertUnwindSafe(|| {
                            provision_one(
                                driver,
                                def,
                                &media,
                                script,
                                profile,
                                budget,
                                preserve_failed,
                            )
                        }));
                        let result = outcome.unwrap_or_else(|payload| {
                            let error = ProvisionError::Panicked(panic_message(payload));
                            println!("  {} {}: {error}", "✗".red().bold(), name);
                            ProvisioningResult {
                                name,
                                final_state: InstallState::Failed,
                                error: Some(error),
                                elapsed: started.elapsed(),
                                transcript: Vec::new(),
                            }
                        });
                        let _ = tx.send(result);
                    });
                    active += 1;
                }
                if active == 0 {
                    break;
                }
                match rx.recv() {
                    Ok(result) => {
                        active -= 1;
                        if self.policy.fail_fast
                            && result.final_state != InstallState::Completed
                        {
                            halted = true;
                        }
                        results.insert(result.name.clone(), result);
                    }
                    Err(_) => break,
                }
            }
        });

        // Whatever is still queued was deliberately never launched.
        for (def, _media) in queue {
            results.insert(def.name.clone(), ProvisioningResult::skipped(def.name));
        }

        Ok(BatchResult::new(results))
    }
}

/// One VM, cradle to verdict. Runs on a worker thread.
fn provision_one(
    driver: &dyn HypervisorDriver,
    def: VmDefinition,
    media: &Path,
    script: &InstallScript,
    profile: &InstallerProfile,
    budget: Duration,
    preserve_failed: bool,
) -> ProvisioningResult {
    let started = Instant::now();
    let deadline = started + budget;
    println!("{} {}", "▶".cyan(), def.name);

    let ActiveVm { handle, mut console } = match driver.define_and_start(&def, media) {
        Ok(vm) => vm,
        Err(e) => {
            println!("  {} {}: {e}", "✗".red().bold(), def.name);
            return ProvisioningResult {
                name: def.name,
                final_state: InstallState::Failed,
                error: Some(ProvisionError::Hypervisor(e)),
                elapsed: started.elapsed(),
                transcript: Vec::new(),
            }
        }
    };

    let mut installer = ConsoleInstaller::new(script, profile);
    let outcome = installer.run(console.as_mut(), Some(deadline));
    console.close();
    let transcript = tail(console.transcript(), TRANSCRIPT_TAIL);

    match outcome {
        Ok(()) => {
            println!(
                "  {} {} ({:.1}s)",
                "✓".green().bold(),
                def.name,
                started.elapsed().as_secs_f64()
            );
            // Dropping the handle without destroy leaves the VM running,
            // which is the contract for completed installs.
            drop(handle);
            ProvisioningResult {
                name: def.name,
                final_state: InstallState::Completed,
                error: None,
                elapsed: started.elapsed(),
                transcript,
            }
        }
        Err(cause) => {
            println!(
                "  {} {} ({:.1}s): {cause}",
                "✗".red().bold(),
                def.name,
                started.elapsed().as_secs_f64()
            );
            if preserve_failed {
                eprintln!("  WARN: preserving failed VM {} for inspection", handle.name());
                drop(handle);
            } else {
                driver.destroy(handle);
            }
            ProvisioningResult {
                name: def.name,
                final_state: InstallState::Failed,
                error: Some(ProvisionError::Install(cause)),
                elapsed: started.elapsed(),
                transcript,
            }
        }
    }
}

fn tail(lines: &[String], keep: usize) -> Vec<String> {
    lines[lines.len().saturating_sub(keep)..].to_vec()
}

/// Best-effort text from a panic payload. `panic!` carries a `String`
/// or `&str`; anything else is opaque.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(text) => *text,
        Err(payload) => match payload.downcast::<&str>() {
            Ok(text) => text.to_string(),
            Err(_) => "unknown cause".into(),
        },
    }
}

fn validate_batch(
    definitions: &[VmDefinition],
    script: &InstallScript,
) -> Result<(), BatchConfigError> {
    if definitions.is_empty() {
        return Err(BatchConfigError::EmptyBatch);
    }
    if script.is_empty() {
        return Err(BatchConfigError::EmptyScript);
    }
    // An empty pattern matches immediately, which would let the
    // installer type ahead of the prompt it is answering.
    for (index, step) in script.steps().iter().enumerate() {
        if step.expect.trim().is_empty() {
            return Err(BatchConfigError::BlankPattern { index });
        }
    }
    let mut seen = HashSet::new();
    for def in definitions {
        if def.name.trim().is_empty() {
            return Err(BatchConfigError::BlankName);
        }
        if !seen.insert(def.name.as_str()) {
            return Err(BatchConfigError::DuplicateName(def.name.clone()));
        }
        if def.memory_mib == 0 {
            return Err(BatchConfigError::InvalidTopology {
                name: def.name.clone(),
                field: "memory_mib",
            });
        }
        if def.vcpus == 0 {
            return Err(BatchConfigError::InvalidTopology {
                name: def.name.clone(),
                field: "vcpus",
            });
        }
        if def.disk_gib == 0 {
            return Err(BatchConfigError::InvalidTopology {
                name: def.name.clone(),
                field: "disk_gib",
            });
        }
    }
    Ok(())
}
