//! Hypervisor backends.
//!
//! A driver turns a [`VmDefinition`] plus an install medium into a
//! running VM with an attached console, and tears one down again.
//! Everything above this trait is backend agnostic; choosing QEMU or
//! libvirt is a constructor-time decision at the edge.

use std::path::{Path, PathBuf};
use std::process::Child;

use thiserror::Error;

use crate::console::ConsoleChannel;
use crate::vm::VmDefinition;

pub mod libvirt;
pub mod qemu;

pub use libvirt::LibvirtDriver;
pub use qemu::QemuDriver;

/// Which provisioning stage a hypervisor operation failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Creating backend resources: disk image, domain definition.
    Define,
    /// Wiring the install medium to the VM.
    AttachMedia,
    /// Launching the VM or attaching its console.
    Start,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Define => write!(f, "define"),
            Self::AttachMedia => write!(f, "attach-media"),
            Self::Start => write!(f, "start"),
        }
    }
}

/// A hypervisor operation that did not leave a usable VM behind.
#[derive(Debug, Error)]
#[error("{stage} failed for VM {name:?}: {message}")]
pub struct HypervisorError {
    pub stage: Stage,
    pub name: String,
    pub message: String,
}

impl HypervisorError {
    pub(crate) fn new(stage: Stage, name: &str, message: impl Into<String>) -> Self {
        Self {
            stage,
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Reference to a started VM, produced by
/// [`HypervisorDriver::define_and_start`] and consumed by
/// [`HypervisorDriver::destroy`].
///
/// Only the driver that produced a handle knows what its fields mean;
/// callers treat it as opaque and hand it back for teardown.
#[derive(Debug)]
pub struct VmHandle {
    name: String,
    process: Option<Child>,
    domain: bool,
    disk: Option<PathBuf>,
}

impl VmHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            process: None,
            domain: false,
            disk: None,
        }
    }

    /// The VM runs as this direct child process.
    pub fn with_process(mut self, child: Child) -> Self {
        self.process = Some(child);
        self
    }

    /// A domain was defined under this handle's name.
    pub fn with_domain(mut self) -> Self {
        self.domain = true;
        self
    }

    /// Disk image to remove on teardown.
    pub fn with_disk(mut self, path: PathBuf) -> Self {
        self.disk = Some(path);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn take_process(&mut self) -> Option<Child> {
        self.process.take()
    }

    pub(crate) fn is_domain(&self) -> bool {
        self.domain
    }

    pub(crate) fn disk(&self) -> Option<&Path> {
        self.disk.as_deref()
    }
}

/// A started VM: the handle for later teardown plus the console the
/// install driver talks through.
pub struct ActiveVm {
    pub handle: VmHandle,
    pub console: Box<dyn ConsoleChannel>,
}

impl std::fmt::Debug for ActiveVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveVm")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Backend contract. `Send + Sync` because one driver instance is
/// shared across the orchestrator's worker threads.
pub trait HypervisorDriver: Send + Sync {
    /// Define the VM described by `def` with `media` attached as its
    /// boot medium, start it, and attach its console. On error nothing
    /// is left behind for the caller to clean up.
    fn define_and_start(
        &self,
        def: &VmDefinition,
        media: &Path,
    ) -> Result<ActiveVm, HypervisorError>;

    /// Tear the VM down and release its resources. Best effort:
    /// problems are logged to stderr, never returned, so error paths
    /// can call this unconditionally.
    fn destroy(&self, handle: VmHandle);
}

/// Both backends refuse to start a VM whose medium is missing rather
/// than let it boot into an empty drive.
pub(crate) fn require_media(name: &str, media: &Path) -> Result<(), HypervisorError> {
    if media.is_file() {
        Ok(())
    } else {
        Err(HypervisorError::new(
            Stage::AttachMedia,
            name,
            format!("install medium {} does not exist", media.display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_names_stage_and_vm() {
        let err = HypervisorError::new(Stage::Start, "node1", "qemu not found");
        assert_eq!(
            err.to_string(),
            "start failed for VM \"node1\": qemu not found"
        );
    }

    #[test]
    fn missing_media_is_an_attach_error() {
        let err = require_media("node1", Path::new("/nonexistent/alpine.iso")).unwrap_err();
        assert_eq!(err.stage, Stage::AttachMedia);
        assert!(err.message.contains("/nonexistent/alpine.iso"));
    }

    struct MuteConsole;

    impl ConsoleChannel for MuteConsole {
        fn send_line(&mut self, _text: &str) -> Result<(), crate::console::ChannelError> {
            Ok(())
        }

        fn expect(
            &mut self,
            _pattern: &str,
            _timeout: std::time::Duration,
        ) -> Result<String, crate::console::ChannelError> {
            Err(crate::console::ChannelError::Closed)
        }

        fn close(&mut self) {}

        fn transcript(&self) -> &[String] {
            &[]
        }
    }

    #[test]
    fn active_vm_debug_elides_the_console() {
        let vm = ActiveVm {
            handle: VmHandle::new("node1"),
            console: Box::new(MuteConsole),
        };
        let rendered = format!("{vm:?}");
        assert!(rendered.contains("node1"), "got {rendered}");
        assert!(!rendered.contains("console"), "got {rendered}");
    }
}
