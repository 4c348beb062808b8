//! libvirt backend.
//!
//! Domains are defined from generated XML and managed through `virsh`,
//! so the only runtime requirement is the libvirt client tools. The
//! console is a `virsh console` child process adopted by the channel,
//! which bridges to the domain's pty.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::console::ProcessConsole;
use crate::vm::{NetworkMode, VmDefinition};

use super::{require_media, ActiveVm, HypervisorDriver, HypervisorError, Stage, VmHandle};

/// System libvirt daemon; override with
/// [`LibvirtDriver::with_uri`] for session or remote daemons.
pub const DEFAULT_URI: &str = "qemu:///system";

/// Render the domain XML for one definition.
///
/// Boot order is install medium first, then the disk it installs onto.
/// The serial console is a pty so `virsh console` can attach to it.
pub fn domain_xml(def: &VmDefinition, media: &Path, disk: &Path) -> String {
    let interface = match def.network {
        // libvirt's default NAT network plays the role QEMU user
        // networking does for the other backend.
        NetworkMode::UserNat => {
            "    <interface type='network'>\n      <source network='default'/>\n      <model type='virtio'/>\n    </interface>\n"
        }
        NetworkMode::None => "",
    };
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <vcpu>{vcpus}</vcpu>
  <os>
    <type arch='x86_64'>hvm</type>
    <boot dev='cdrom'/>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <clock offset='utc'/>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{media}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
{interface}    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <graphics type='vnc' port='-1' autoport='yes'/>
  </devices>
</domain>
"#,
        name = xml_escape(&def.name),
        memory = def.memory_mib,
        vcpus = def.vcpus,
        disk = xml_escape(&disk.display().to_string()),
        media = xml_escape(&media.display().to_string()),
        interface = interface,
    )
}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Driver that manages VMs as libvirt domains.
pub struct LibvirtDriver {
    work_dir: PathBuf,
    uri: String,
}

impl LibvirtDriver {
    /// `work_dir` receives per-VM disk images and domain XML files.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            uri: DEFAULT_URI.to_string(),
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    fn virsh(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new("virsh")
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .output()
            .map_err(|e| format!("run virsh: {e}"))?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn disk_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(format!("{name}.qcow2"))
    }

    fn xml_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(format!("{name}.xml"))
    }

    /// Undo a partially created domain after a failed start.
    fn unwind(&self, name: &str, disk: &Path) {
        let _ = self.virsh(&["undefine", name]);
        let _ = fs::remove_file(disk);
        let _ = fs::remove_file(self.xml_path(name));
    }
}

impl HypervisorDriver for LibvirtDriver {
    fn define_and_start(
        &self,
        def: &VmDefinition,
        media: &Path,
    ) -> Result<ActiveVm, HypervisorError> {
        require_media(&def.name, media)?;

        fs::create_dir_all(&self.work_dir)
            .map_err(|e| HypervisorError::new(Stage::Define, &def.name, e.to_string()))?;
        let disk = self.disk_path(&def.name);
        super::qemu::create_disk(&disk, def.disk_gib)
            .map_err(|msg| HypervisorError::new(Stage::Define, &def.name, msg))?;

        let xml = domain_xml(def, media, &disk);
        let xml_file = self.xml_path(&def.name);
        fs::write(&xml_file, &xml)
            .map_err(|e| HypervisorError::new(Stage::Define, &def.name, e.to_string()))?;

        if let Err(msg) = self.virsh(&["define", &xml_file.display().to_string()]) {
            let _ = fs::remove_file(&disk);
            let _ = fs::remove_file(&xml_file);
            return Err(HypervisorError::new(Stage::Define, &def.name, msg));
        }

        if let Err(msg) = self.virsh(&["start", &def.name]) {
            self.unwind(&def.name, &disk);
            return Err(HypervisorError::new(Stage::Start, &def.name, msg));
        }

        let bridge = Command::new("virsh")
            .arg("-c")
            .arg(&self.uri)
            .args(["console", &def.name, "--force"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();
        let bridge = match bridge {
            Ok(child) => child,
            Err(e) => {
                let _ = self.virsh(&["destroy", &def.name]);
                self.unwind(&def.name, &disk);
                return Err(HypervisorError::new(
                    Stage::Start,
                    &def.name,
                    format!("spawn virsh console: {e}"),
                ));
            }
        };

        let console = match ProcessConsole::adopt(bridge) {
            Ok(console) => console,
            Err(e) => {
                let _ = self.virsh(&["destroy", &def.name]);
                self.unwind(&def.name, &disk);
                return Err(HypervisorError::new(
                    Stage::Start,
                    &def.name,
                    format!("attach console: {e}"),
                ));
            }
        };

        Ok(ActiveVm {
            handle: VmHandle::new(&def.name).with_domain().with_disk(disk),
            console: Box::new(console),
        })
    }

    fn destroy(&self, handle: VmHandle) {
        let name = handle.name().to_string();
        if handle.is_domain() {
            if let Err(e) = self.virsh(&["destroy", &name]) {
                eprintln!("  WARN: virsh destroy {name}: {e}");
            }
            if let Err(e) = self.virsh(&["undefine", &name]) {
                eprintln!("  WARN: virsh undefine {name}: {e}");
            }
        }
        if let Some(disk) = handle.disk() {
            if disk.exists() {
                if let Err(e) = fs::remove_file(disk) {
                    eprintln!("  WARN: remove disk of VM {name}: {e}");
                }
            }
        }
        let xml = self.xml_path(&name);
        if xml.exists() {
            let _ = fs::remove_file(xml);
        }
    }
}
