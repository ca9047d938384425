//! Inode identity.
//!
//! Every inode has an [`InodeId`]. Inodes that describe a cloud node reuse
//! the node's [`NodeHandle`] as their id; inodes created locally (not yet
//! uploaded) draw ids from a separate synthetic range marked by the high
//! bit. The kernel sees a third space, [`MountInodeId`], in which each
//! mount's root is always `1`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 48-bit handle of a node in the cloud tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle(u64);

impl NodeHandle {
    pub const MASK: u64 = 0xFFFF_FFFF_FFFF;
    pub const UNDEFINED: NodeHandle = NodeHandle(Self::MASK);

    /// Build a handle from its raw value, discarding bits above 48.
    pub const fn new(raw: u64) -> Self {
        Self(raw & Self::MASK)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn is_defined(self) -> bool {
        self != Self::UNDEFINED
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012X}", self.0)
    }
}

/// Identifier of an inode for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    const SYNTHETIC: u64 = 1 << 63;

    pub const UNDEFINED: InodeId = InodeId(u64::MAX);

    /// The `n`th synthetic id.
    pub const fn synthetic(n: u64) -> Self {
        Self(Self::SYNTHETIC | (n & !Self::SYNTHETIC))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn is_synthetic(self) -> bool {
        self.0 & Self::SYNTHETIC != 0 && self != Self::UNDEFINED
    }

    pub fn is_defined(self) -> bool {
        self != Self::UNDEFINED
    }

    /// Position of a synthetic id within the synthetic range.
    pub fn ordinal(self) -> Option<u64> {
        self.is_synthetic().then_some(self.0 & !Self::SYNTHETIC)
    }

    /// The cloud handle this id was derived from, if any.
    pub fn handle(self) -> Option<NodeHandle> {
        (!self.is_synthetic() && self.is_defined() && self.0 <= NodeHandle::MASK)
            .then_some(NodeHandle(self.0))
    }

    /// The cloud handle this id was derived from.
    ///
    /// # Panics
    ///
    /// If the id is synthetic or undefined: such ids never name a cloud node.
    pub fn to_handle(self) -> NodeHandle {
        match self.handle() {
            Some(handle) => handle,
            None => panic!("inode {} does not describe a cloud node", self),
        }
    }
}

impl From<NodeHandle> for InodeId {
    fn from(handle: NodeHandle) -> Self {
        if handle.is_defined() {
            Self(handle.get())
        } else {
            Self::UNDEFINED
        }
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ordinal() {
            Some(n) => write!(f, "~{}", n),
            None if !self.is_defined() => f.write_str("undefined"),
            None => write!(f, "{:012X}", self.0),
        }
    }
}

/// Inode number as seen by the kernel for one particular mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountInodeId(u64);

impl MountInodeId {
    pub const ROOT: MountInodeId = MountInodeId(1);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MountInodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Translation between [`InodeId`] and [`MountInodeId`] for one mount.
///
/// The mount's root becomes `1`, and whatever inode has the raw value `1`
/// takes the root's raw value instead, so the mapping stays a bijection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeIdMap {
    root: InodeId,
}

impl InodeIdMap {
    pub fn new(root: InodeId) -> Self {
        Self { root }
    }

    pub fn to_mount(&self, id: InodeId) -> MountInodeId {
        if id == self.root {
            MountInodeId::ROOT
        } else if id.get() == MountInodeId::ROOT.get() {
            MountInodeId(self.root.get())
        } else {
            MountInodeId(id.get())
        }
    }

    pub fn to_inode(&self, id: MountInodeId) -> InodeId {
        if id == MountInodeId::ROOT {
            self.root
        } else if id.get() == self.root.get() {
            InodeId(MountInodeId::ROOT.get())
        } else {
            InodeId(id.get())
        }
    }

    pub fn root(&self) -> InodeId {
        self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_identity_round_trip() {
        for raw in [0u64, 1, 2, 0xABCD, NodeHandle::MASK - 1] {
            let handle = NodeHandle::new(raw);
            let id = InodeId::from(handle);
            assert!(!id.is_synthetic());
            assert_eq!(id.to_handle(), handle);
        }
    }

    #[test]
    fn test_undefined_handle_maps_to_undefined_id() {
        let id = InodeId::from(NodeHandle::UNDEFINED);
        assert_eq!(id, InodeId::UNDEFINED);
        assert!(!id.is_defined());
        assert!(!id.is_synthetic());
        assert_eq!(id.handle(), None);
    }

    #[test]
    fn test_synthetic_ids_never_name_cloud_nodes() {
        let id = InodeId::synthetic(5);
        assert!(id.is_synthetic());
        assert_eq!(id.ordinal(), Some(5));
        assert_eq!(id.handle(), None);
        assert_ne!(id, InodeId::from(NodeHandle::new(5)));
    }

    #[test]
    #[should_panic(expected = "does not describe a cloud node")]
    fn test_to_handle_on_synthetic_panics() {
        InodeId::synthetic(1).to_handle();
    }

    #[test]
    fn test_mount_map_is_a_bijection() {
        let root = InodeId::from(NodeHandle::new(42));
        let map = InodeIdMap::new(root);

        assert_eq!(map.to_mount(root), MountInodeId::ROOT);
        assert_eq!(map.to_inode(MountInodeId::ROOT), root);

        let one = InodeId::from_raw(1);
        assert_eq!(map.to_mount(one), MountInodeId::new(42));
        assert_eq!(map.to_inode(MountInodeId::new(42)), one);

        for raw in [0u64, 2, 7, 41, 43, InodeId::synthetic(9).get()] {
            let id = InodeId::from_raw(raw);
            assert_eq!(map.to_inode(map.to_mount(id)), id);
        }
    }

    #[test]
    fn test_mount_map_with_root_one_is_identity() {
        let map = InodeIdMap::new(InodeId::from_raw(1));
        for raw in [1u64, 2, 3] {
            let id = InodeId::from_raw(raw);
            assert_eq!(map.to_mount(id).get(), raw);
        }
    }
}
