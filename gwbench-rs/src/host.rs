//! Session boundary to the hypervisor hosting each pool instance.
//!
//! The orchestrator only ever needs a handful of operations against a host:
//! locate a VM by name, read and write its tag annotation, walk its snapshot
//! tree, revert, and power on. [`HostClient`] captures exactly that surface;
//! the `gwb` binary provides a REST-backed implementation and tests provide
//! an in-memory one.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::pool::HostSpec;
use crate::tag::PowerStatus;

#[derive(Debug, Error)]
pub enum HostError {
    /// No VM with the requested name exists on the host. A missing pool
    /// instance indicates pool misconfiguration and is never retried.
    #[error("no VM named {0:?} on host")]
    VmNotFound(String),

    #[error("host agent request failed: {0}")]
    Transport(String),

    #[error("host agent rejected request: {0}")]
    Api(String),
}

/// A live VM as returned by [`HostClient::find_vm`].
#[derive(Debug, Clone)]
pub struct VmInfo {
    /// Stable identifier assigned by the host.
    pub id: String,
    pub power: PowerStatus,
    /// Raw tag annotation, decoded by [`crate::tag::decode`].
    pub annotation: String,
}

/// One node of a VM's snapshot tree.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<SnapshotNode>,
}

/// Locates a snapshot by name with a breadth-first traversal of the tree.
///
/// When duplicate names exist the shallowest match wins, ties broken by
/// sibling order.
pub fn find_snapshot_by_name<'a>(
    roots: &'a [SnapshotNode],
    name: &str,
) -> Option<&'a SnapshotNode> {
    let mut queue: VecDeque<&SnapshotNode> = roots.iter().collect();
    while let Some(node) = queue.pop_front() {
        if node.name == name {
            return Some(node);
        }
        queue.extend(node.children.iter());
    }
    None
}

/// Authenticated hypervisor session, scoped per call to one host.
///
/// Every mutating operation waits for the underlying host task to complete
/// before returning.
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Finds the VM matching `name` on `host`. Zero matches is a hard
    /// [`HostError::VmNotFound`]; if the host somehow reports several, the
    /// first one wins.
    async fn find_vm(&self, host: &HostSpec, name: &str) -> Result<VmInfo, HostError>;

    /// Replaces the VM's tag annotation.
    async fn set_annotation(
        &self,
        host: &HostSpec,
        vm_id: &str,
        annotation: &str,
    ) -> Result<(), HostError>;

    /// Returns the root nodes of the VM's snapshot tree.
    async fn snapshot_tree(
        &self,
        host: &HostSpec,
        vm_id: &str,
    ) -> Result<Vec<SnapshotNode>, HostError>;

    /// Reverts the VM to the snapshot with the given id.
    async fn revert_to_snapshot(
        &self,
        host: &HostSpec,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<(), HostError>;

    /// Reverts the VM to whatever snapshot is "current" on the host.
    async fn revert_to_current(&self, host: &HostSpec, vm_id: &str) -> Result<(), HostError>;

    async fn power_on(&self, host: &HostSpec, vm_id: &str) -> Result<(), HostError>;

    /// Takes an ad hoc snapshot of the VM.
    async fn create_snapshot(
        &self,
        host: &HostSpec,
        vm_id: &str,
        name: &str,
    ) -> Result<(), HostError>;

    /// Removes a snapshot subtree.
    async fn remove_snapshot(
        &self,
        host: &HostSpec,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<(), HostError>;
}
