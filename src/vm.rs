//! VM and install-media definitions.

use serde::{Deserialize, Serialize};

/// Install medium identity: which release tree, which version, which
/// architecture. Two equal refs resolve to the same cached ISO.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaRef {
    /// Mirror serving the release tree, e.g. `dl-cdn.alpinelinux.org`.
    /// A scheme may be included; `https://` is assumed otherwise.
    pub base_url: String,
    /// Full release version, e.g. `3.20.0`.
    pub version: String,
    /// Guest architecture, e.g. `x86_64`.
    pub architecture: String,
}

impl MediaRef {
    pub fn new(
        base_url: impl Into<String>,
        version: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            version: version.into(),
            architecture: architecture.into(),
        }
    }
}

/// Host-side network wiring for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Outbound NAT: QEMU user networking, or libvirt's default
    /// network. The guest can reach out (mirrors, NTP); nothing can
    /// reach in.
    #[default]
    UserNat,
    /// No NIC at all.
    None,
}

/// Immutable description of one VM to provision.
///
/// Names must be unique within a batch; they key results and name
/// backend resources (disk images, libvirt domains).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDefinition {
    pub name: String,
    pub memory_mib: u32,
    pub vcpus: u32,
    pub disk_gib: u32,
    pub media: MediaRef,
    pub network: NetworkMode,
}

impl VmDefinition {
    /// A small single-core guest, enough for a text-mode installer.
    /// Adjust with the builder methods.
    pub fn new(name: impl Into<String>, media: MediaRef) -> Self {
        Self {
            name: name.into(),
            memory_mib: 512,
            vcpus: 1,
            disk_gib: 2,
            media,
            network: NetworkMode::default(),
        }
    }

    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.memory_mib = mib;
        self
    }

    pub fn vcpus(mut self, count: u32) -> Self {
        self.vcpus = count;
        self
    }

    pub fn disk_gib(mut self, gib: u32) -> Self {
        self.disk_gib = gib;
        self
    }

    pub fn network(mut self, mode: NetworkMode) -> Self {
        self.network = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let media = MediaRef::new("dl-cdn.alpinelinux.org", "3.20.0", "x86_64");
        let def = VmDefinition::new("node1", media.clone())
            .memory_mib(1024)
            .vcpus(2)
            .disk_gib(8)
            .network(NetworkMode::None);
        assert_eq!(def.name, "node1");
        assert_eq!(def.memory_mib, 1024);
        assert_eq!(def.vcpus, 2);
        assert_eq!(def.disk_gib, 8);
        assert_eq!(def.network, NetworkMode::None);
        assert_eq!(def.media, media);
    }

    #[test]
    fn equal_media_refs_are_interchangeable_cache_keys() {
        use std::collections::HashSet;
        let a = MediaRef::new("dl-cdn.alpinelinux.org", "3.20.0", "x86_64");
        let b = MediaRef::new("dl-cdn.alpinelinux.org", "3.20.0", "x86_64");
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
