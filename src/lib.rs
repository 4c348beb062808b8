//! Unattended Alpine Linux VM fleet provisioning.
//!
//! This library takes a set of VM definitions and drives each one from
//! nothing to an installed system by automating the installer over the
//! VM's text console:
//! - Media cache that downloads install ISOs on first use
//! - Console channels with expect/send semantics over child stdio
//! - An install state machine that answers the setup dialogue
//! - QEMU and libvirt backends behind one driver trait
//! - A batch orchestrator with bounded concurrency and cleanup policy

pub mod console;
pub mod hypervisor;
pub mod installer;
pub mod media;
pub mod orchestrator;
pub mod script;
pub mod vm;

// Re-export commonly used items
pub use console::{ChannelError, ConsoleChannel, ProcessConsole};
pub use hypervisor::{
    ActiveVm, HypervisorDriver, HypervisorError, LibvirtDriver, QemuDriver, Stage, VmHandle,
};
pub use installer::{ConsoleInstaller, InstallError, InstallState};
pub use media::{FetchError, MediaCache};
pub use orchestrator::{
    BatchConfigError, BatchOutcome, BatchPolicy, BatchResult, ProvisionError,
    ProvisioningOrchestrator, ProvisioningResult,
};
pub use script::{AlpineSetup, InstallScript, InstallerProfile, ScriptError, ScriptFile, Step};
pub use vm::{MediaRef, NetworkMode, VmDefinition};
