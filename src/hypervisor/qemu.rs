//! QEMU backend.
//!
//! Each VM is a direct child of this process with the guest serial port
//! on the child's stdio pipes, so no daemon or root privileges are
//! involved. KVM is used when available and silently degrades to TCG.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::console::ProcessConsole;
use crate::vm::{NetworkMode, VmDefinition};

use super::{require_media, ActiveVm, HypervisorDriver, HypervisorError, Stage, VmHandle};

/// Assembles a `qemu-system-x86_64` invocation for one guest.
pub struct QemuBuilder {
    memory_mib: u32,
    smp: u32,
    cdrom: Option<PathBuf>,
    disk: Option<PathBuf>,
    network: NetworkMode,
}

impl Default for QemuBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QemuBuilder {
    pub fn new() -> Self {
        Self {
            memory_mib: 512,
            smp: 1,
            cdrom: None,
            disk: None,
            network: NetworkMode::default(),
        }
    }

    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.memory_mib = mib;
        self
    }

    pub fn smp(mut self, vcpus: u32) -> Self {
        self.smp = vcpus;
        self
    }

    /// Boot ISO, attached over virtio-scsi so modern kernels see it
    /// without legacy IDE emulation.
    pub fn cdrom(mut self, path: PathBuf) -> Self {
        self.cdrom = Some(path);
        self
    }

    /// qcow2 system disk on virtio.
    pub fn disk(mut self, path: PathBuf) -> Self {
        self.disk = Some(path);
        self
    }

    pub fn network(mut self, mode: NetworkMode) -> Self {
        self.network = mode;
        self
    }

    /// Build the command with stdio piped for console control. The
    /// guest serial port ends up on the child's stdin/stdout.
    pub fn build_piped(self) -> Command {
        let mut cmd = self.build_base();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }

    fn build_base(self) -> Command {
        let mut cmd = Command::new("qemu-system-x86_64");

        // No default devices; everything below is explicit.
        cmd.arg("-nodefaults");
        cmd.args(["-accel", "kvm:tcg"]);
        cmd.args(["-cpu", "max"]);
        cmd.args(["-m", &format!("{}M", self.memory_mib)]);
        cmd.args(["-smp", &self.smp.to_string()]);

        if let Some(cdrom) = &self.cdrom {
            cmd.args([
                "-device",
                "virtio-scsi-pci,id=scsi0",
                "-device",
                "scsi-cd,drive=cdrom0,bus=scsi0.0",
                "-drive",
                &format!(
                    "id=cdrom0,if=none,format=raw,readonly=on,file={}",
                    cdrom.display()
                ),
            ]);
        }

        if let Some(disk) = &self.disk {
            cmd.args([
                "-drive",
                &format!("file={},format=qcow2,if=virtio", disk.display()),
            ]);
        }

        match self.network {
            NetworkMode::UserNat => {
                cmd.args([
                    "-netdev",
                    "user,id=net0",
                    "-device",
                    "virtio-net-pci,netdev=net0",
                ]);
            }
            // -nodefaults already means no NIC.
            NetworkMode::None => {}
        }

        cmd.args(["-nographic", "-serial", "mon:stdio"]);
        // Install medium first, then the freshly installed disk.
        cmd.args(["-boot", "order=dc"]);

        cmd
    }
}

/// Create a fresh qcow2 image, replacing any leftover of the same name.
pub(crate) fn create_disk(path: &Path, size_gib: u32) -> Result<(), String> {
    if path.exists() {
        fs::remove_file(path).map_err(|e| format!("remove old disk image: {e}"))?;
    }
    let output = Command::new("qemu-img")
        .args(["create", "-f", "qcow2"])
        .arg(path)
        .arg(format!("{size_gib}G"))
        .output()
        .map_err(|e| format!("run qemu-img: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "qemu-img create failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Driver that runs every VM as a direct QEMU child process.
pub struct QemuDriver {
    work_dir: PathBuf,
}

impl QemuDriver {
    /// `work_dir` receives the per-VM disk images.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn disk_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(format!("{name}.qcow2"))
    }
}

impl HypervisorDriver for QemuDriver {
    fn define_and_start(
        &self,
        def: &VmDefinition,
        media: &Path,
    ) -> Result<ActiveVm, HypervisorError> {
        require_media(&def.name, media)?;

        fs::create_dir_all(&self.work_dir)
            .map_err(|e| HypervisorError::new(Stage::Define, &def.name, e.to_string()))?;
        let disk = self.disk_path(&def.name);
        create_disk(&disk, def.disk_gib)
            .map_err(|msg| HypervisorError::new(Stage::Define, &def.name, msg))?;

        let mut child = QemuBuilder::new()
            .memory_mib(def.memory_mib)
            .smp(def.vcpus)
            .cdrom(media.to_path_buf())
            .disk(disk.clone())
            .network(def.network)
            .build_piped()
            .spawn()
            .map_err(|e| {
                HypervisorError::new(
                    Stage::Start,
                    &def.name,
                    format!("spawn qemu-system-x86_64: {e}"),
                )
            })?;

        let console = match ProcessConsole::attach(&mut child) {
            Ok(console) => console,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HypervisorError::new(
                    Stage::Start,
                    &def.name,
                    format!("attach console: {e}"),
                ));
            }
        };

        Ok(ActiveVm {
            handle: VmHandle::new(&def.name)
                .with_process(child)
                .with_disk(disk),
            console: Box::new(console),
        })
    }

    fn destroy(&self, mut handle: VmHandle) {
        if let Some(mut child) = handle.take_process() {
            if let Err(e) = child.kill() {
                eprintln!("  WARN: kill VM {}: {e}", handle.name());
            }
            let _ = child.wait();
        }
        if let Some(disk) = handle.disk() {
            if disk.exists() {
                if let Err(e) = fs::remove_file(disk) {
                    eprintln!("  WARN: remove disk of VM {}: {e}", handle.name());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::MediaRef;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn builder_assembles_topology_args() {
        let cmd = QemuBuilder::new()
            .memory_mib(768)
            .smp(2)
            .cdrom(PathBuf::from("/isos/alpine.iso"))
            .disk(PathBuf::from("/work/node1.qcow2"))
            .build_piped();

        assert_eq!(cmd.get_program(), "qemu-system-x86_64");
        let args = args_of(&cmd);
        assert!(args.windows(2).any(|w| w == ["-m", "768M"]));
        assert!(args.windows(2).any(|w| w == ["-smp", "2"]));
        assert!(args
            .iter()
            .any(|a| a.contains("file=/work/node1.qcow2") && a.contains("if=virtio")));
        assert!(args
            .iter()
            .any(|a| a.contains("file=/isos/alpine.iso") && a.contains("readonly=on")));
        assert!(args.windows(2).any(|w| w == ["-boot", "order=dc"]));
        assert!(args.windows(2).any(|w| w == ["-serial", "mon:stdio"]));
    }

    #[test]
    fn user_nat_is_the_only_mode_with_a_nic() {
        let nat = args_of(&QemuBuilder::new().build_piped());
        assert!(nat.iter().any(|a| a.starts_with("user,id=net0")));

        let none = args_of(&QemuBuilder::new().network(NetworkMode::None).build_piped());
        assert!(!none.iter().any(|a| a.contains("netdev")));
    }

    #[test]
    fn missing_media_fails_before_any_disk_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let driver = QemuDriver::new(dir.path());
        let def = VmDefinition::new(
            "node1",
            MediaRef::new("dl-cdn.alpinelinux.org", "3.20.0", "x86_64"),
        );

        let err = driver
            .define_and_start(&def, Path::new("/nonexistent/alpine.iso"))
            .unwrap_err();
        assert_eq!(err.stage, Stage::AttachMedia);
        assert!(!driver.disk_path("node1").exists());
    }

    #[test]
    fn destroy_tolerates_an_empty_handle() {
        let dir = tempfile::tempdir().unwrap();
        let driver = QemuDriver::new(dir.path());
        driver.destroy(VmHandle::new("ghost"));
    }
}
