//! Reservation controller: claims and releases pool instances through their
//! tag annotation, and reverts them to a golden snapshot on release.

use log::{info, warn};
use thiserror::Error;

use crate::host::{self, HostClient, HostError};
use crate::pool::{HostSpec, PoolInstance};
use crate::tag::{self, PowerStatus, TagValue};

#[derive(Debug, Error)]
pub enum ReserveError {
    /// The instance is already held by someone else. `holder` is `None`
    /// when the tag says reserved without recording an owner. The claim is
    /// not written; the caller decides whether to pick another instance.
    #[error("instance is already reserved by {}", .holder.as_deref().unwrap_or("an unrecorded run"))]
    Conflict { holder: Option<String> },

    #[error("snapshot {0:?} not found on the instance")]
    SnapshotNotFound(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

/// Claims `instance` for `owner` and persists the owner token into the
/// instance's tag annotation.
///
/// The live tag is re-read immediately before the write, so a reservation
/// taken by another run since the last refresh surfaces as a typed
/// [`ReserveError::Conflict`] instead of being overwritten. Two claimants
/// racing inside the read/write window can still both succeed; callers that
/// cannot tolerate that must serialize runs per instance externally.
pub async fn claim(
    client: &dyn HostClient,
    host: &HostSpec,
    instance: &mut PoolInstance,
    owner: &str,
) -> Result<(), ReserveError> {
    let vm = client.find_vm(host, &instance.spec.name).await?;
    let mut live = instance.state.clone();
    tag::decode(&vm.annotation, &mut live);
    match &live.in_ci_use {
        TagValue::Text(holder) if holder != owner => {
            return Err(ReserveError::Conflict {
                holder: Some(holder.clone()),
            });
        }
        TagValue::Text(_) => {
            warn!(
                "{} is already marked for {owner}, rewriting the tag",
                instance.spec.name
            );
        }
        // A bare True means reserved by a run that did not record itself.
        TagValue::Bool(true) => {
            return Err(ReserveError::Conflict { holder: None });
        }
        TagValue::Bool(false) => {}
    }

    instance.live_id = Some(vm.id.clone());
    instance.state.in_ci_use = TagValue::Text(owner.to_string());
    client
        .set_annotation(host, &vm.id, &tag::encode(&instance.state))
        .await?;
    info!("claimed {} for {owner}", instance.spec.name);
    Ok(())
}

/// Clears the reservation field and persists the change.
pub async fn release(
    client: &dyn HostClient,
    host: &HostSpec,
    instance: &mut PoolInstance,
) -> Result<(), ReserveError> {
    let vm = client.find_vm(host, &instance.spec.name).await?;
    instance.live_id = Some(vm.id.clone());
    instance.state.in_ci_use = TagValue::Bool(false);
    client
        .set_annotation(host, &vm.id, &tag::encode(&instance.state))
        .await?;
    info!("released {}", instance.spec.name);
    Ok(())
}

/// Reverts `instance` to its golden image.
///
/// A named snapshot is located by breadth-first search over the snapshot
/// tree (first match wins when names are duplicated); a missing name is a
/// reportable [`ReserveError::SnapshotNotFound`]. With no name, the host's
/// notion of the "current" snapshot is used. A revert can leave the instance
/// powered off, in which case it is powered back on.
pub async fn reset_to_golden(
    client: &dyn HostClient,
    host: &HostSpec,
    instance: &mut PoolInstance,
    snapshot_name: Option<&str>,
) -> Result<(), ReserveError> {
    let vm = client.find_vm(host, &instance.spec.name).await?;
    match snapshot_name {
        Some(name) => {
            let tree = client.snapshot_tree(host, &vm.id).await?;
            let snapshot = host::find_snapshot_by_name(&tree, name)
                .ok_or_else(|| ReserveError::SnapshotNotFound(name.to_string()))?;
            info!(
                "reverting {} to snapshot {name:?} ({})",
                instance.spec.name, snapshot.id
            );
            client.revert_to_snapshot(host, &vm.id, &snapshot.id).await?;
        }
        None => {
            info!("reverting {} to its current snapshot", instance.spec.name);
            client.revert_to_current(host, &vm.id).await?;
        }
    }

    let vm = client.find_vm(host, &instance.spec.name).await?;
    if vm.power == PowerStatus::PoweredOff {
        info!("{} is powered off after revert, powering on", instance.spec.name);
        client.power_on(host, &vm.id).await?;
        instance.state.power_status = PowerStatus::PoweredOn;
    } else {
        instance.state.power_status = vm.power;
    }
    Ok(())
}

/// Takes an ad hoc snapshot of the instance.
pub async fn capture_snapshot(
    client: &dyn HostClient,
    host: &HostSpec,
    instance: &PoolInstance,
    name: &str,
) -> Result<(), ReserveError> {
    let vm = client.find_vm(host, &instance.spec.name).await?;
    client.create_snapshot(host, &vm.id, name).await?;
    info!("captured snapshot {name:?} of {}", instance.spec.name);
    Ok(())
}

/// Removes a named snapshot subtree from the instance.
pub async fn remove_snapshot(
    client: &dyn HostClient,
    host: &HostSpec,
    instance: &PoolInstance,
    name: &str,
) -> Result<(), ReserveError> {
    let vm = client.find_vm(host, &instance.spec.name).await?;
    let tree = client.snapshot_tree(host, &vm.id).await?;
    let snapshot = host::find_snapshot_by_name(&tree, name)
        .ok_or_else(|| ReserveError::SnapshotNotFound(name.to_string()))?;
    client.remove_snapshot(host, &vm.id, &snapshot.id).await?;
    info!("removed snapshot {name:?} from {}", instance.spec.name);
    Ok(())
}
