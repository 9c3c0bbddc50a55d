//! Reservation lifecycle against an in-memory host client: refresh, claim,
//! read-your-own-write, conflict detection, release, and golden-image reset.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use gwbench_rs::host::{HostClient, HostError, SnapshotNode, VmInfo};
use gwbench_rs::pool::{HostSpec, Inventory};
use gwbench_rs::reserve::{self, ReserveError};
use gwbench_rs::tag::{PowerStatus, TagValue};

const TOPOLOGY: &str = r#"
    [[hosts]]
    name = "lab-host-1"
    address = "10.0.0.10"
    password = "hostpw"

    [[instances]]
    name = "gw-1"
    address = "10.0.1.1"
    host = "lab-host-1"

    [[instances]]
    name = "gw-2"
    address = "10.0.1.2"
    host = "lab-host-1"
"#;

struct MockVm {
    id: String,
    power: PowerStatus,
    annotation: String,
    snapshots: Vec<SnapshotNode>,
    reverted_to: Option<String>,
}

struct MockHostClient {
    vms: Mutex<HashMap<String, MockVm>>,
}

impl MockHostClient {
    fn new(vms: Vec<MockVm>, names: &[&str]) -> MockHostClient {
        let map = names
            .iter()
            .map(|n| n.to_string())
            .zip(vms)
            .collect::<HashMap<_, _>>();
        MockHostClient {
            vms: Mutex::new(map),
        }
    }

    fn vm(id: &str, power: PowerStatus) -> MockVm {
        MockVm {
            id: id.to_string(),
            power,
            annotation: "power_status:poweredOn,in_ci_use:False".to_string(),
            snapshots: vec![SnapshotNode {
                id: "snap-1".to_string(),
                name: "golden".to_string(),
                children: vec![],
            }],
            reverted_to: None,
        }
    }

    fn annotation_of(&self, name: &str) -> String {
        self.vms.lock().unwrap()[name].annotation.clone()
    }

    fn with_vm<R>(&self, id: &str, f: impl FnOnce(&mut MockVm) -> R) -> Result<R, HostError> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .values_mut()
            .find(|vm| vm.id == id)
            .ok_or_else(|| HostError::Api(format!("unknown vm id {id:?}")))?;
        Ok(f(vm))
    }
}

#[async_trait]
impl HostClient for MockHostClient {
    async fn find_vm(&self, _host: &HostSpec, name: &str) -> Result<VmInfo, HostError> {
        let vms = self.vms.lock().unwrap();
        let vm = vms
            .get(name)
            .ok_or_else(|| HostError::VmNotFound(name.to_string()))?;
        Ok(VmInfo {
            id: vm.id.clone(),
            power: vm.power,
            annotation: vm.annotation.clone(),
        })
    }

    async fn set_annotation(
        &self,
        _host: &HostSpec,
        vm_id: &str,
        annotation: &str,
    ) -> Result<(), HostError> {
        self.with_vm(vm_id, |vm| vm.annotation = annotation.to_string())
    }

    async fn snapshot_tree(
        &self,
        _host: &HostSpec,
        vm_id: &str,
    ) -> Result<Vec<SnapshotNode>, HostError> {
        self.with_vm(vm_id, |vm| vm.snapshots.clone())
    }

    async fn revert_to_snapshot(
        &self,
        _host: &HostSpec,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<(), HostError> {
        self.with_vm(vm_id, |vm| {
            vm.reverted_to = Some(snapshot_id.to_string());
            // The golden image was captured powered off.
            vm.power = PowerStatus::PoweredOff;
        })
    }

    async fn revert_to_current(&self, _host: &HostSpec, vm_id: &str) -> Result<(), HostError> {
        self.with_vm(vm_id, |vm| vm.reverted_to = Some("current".to_string()))
    }

    async fn power_on(&self, _host: &HostSpec, vm_id: &str) -> Result<(), HostError> {
        self.with_vm(vm_id, |vm| vm.power = PowerStatus::PoweredOn)
    }

    async fn create_snapshot(
        &self,
        _host: &HostSpec,
        vm_id: &str,
        name: &str,
    ) -> Result<(), HostError> {
        self.with_vm(vm_id, |vm| {
            vm.snapshots.push(SnapshotNode {
                id: format!("snap-{}", vm.snapshots.len() + 1),
                name: name.to_string(),
                children: vec![],
            })
        })
    }

    async fn remove_snapshot(
        &self,
        _host: &HostSpec,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<(), HostError> {
        self.with_vm(vm_id, |vm| {
            vm.snapshots.retain(|s| s.id != snapshot_id);
        })
    }
}

fn lab() -> (MockHostClient, Inventory) {
    let client = MockHostClient::new(
        vec![
            MockHostClient::vm("vm-101", PowerStatus::PoweredOn),
            MockHostClient::vm("vm-102", PowerStatus::PoweredOn),
        ],
        &["gw-1", "gw-2"],
    );
    let inventory = Inventory::parse(TOPOLOGY).unwrap();
    (client, inventory)
}

#[tokio::test]
async fn claim_writes_owner_tag_and_refresh_observes_it() {
    let (client, mut inventory) = lab();
    inventory.refresh(&client).await.unwrap();
    assert_eq!(inventory.available().len(), 2);

    let index = inventory.instance_index("gw-1").unwrap();
    let host = inventory.host_of(&inventory.instances[index]).clone();
    reserve::claim(
        &client,
        &host,
        &mut inventory.instances[index],
        "controller-1.example.com",
    )
    .await
    .unwrap();

    assert!(client
        .annotation_of("gw-1")
        .contains("in_ci_use:controller-1.example.com"));

    // Read-your-own-write: a refresh within the same process must observe
    // the owner token that was just written.
    inventory.refresh(&client).await.unwrap();
    assert_eq!(
        inventory.instances[index].state.in_ci_use.owner(),
        Some("controller-1.example.com")
    );
    let available = inventory.available();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].spec.name, "gw-2");
}

#[tokio::test]
async fn second_claimant_gets_a_typed_conflict() {
    let (client, mut inventory) = lab();
    inventory.refresh(&client).await.unwrap();

    let index = inventory.instance_index("gw-1").unwrap();
    let host = inventory.host_of(&inventory.instances[index]).clone();
    reserve::claim(&client, &host, &mut inventory.instances[index], "controller-1")
        .await
        .unwrap();

    // A second run with stale state races for the same instance.
    let mut stale = Inventory::parse(TOPOLOGY).unwrap();
    stale.refresh(&client).await.ok();
    let err = reserve::claim(&client, &host, &mut stale.instances[index], "controller-2")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReserveError::Conflict { holder: Some(ref holder) } if holder == "controller-1"
    ));
    assert!(client.annotation_of("gw-1").contains("controller-1"));

    // Refreshing stale state first reports the same conflict.
    stale.refresh(&client).await.unwrap();
    assert!(!stale.instances[index].state.in_ci_use.is_free());
}

#[tokio::test]
async fn bare_reserved_tag_is_a_conflict_with_unknown_holder() {
    let (client, mut inventory) = lab();
    // Reserved by hand, without an owner token recorded.
    let lab_host = inventory.hosts[0].clone();
    client
        .set_annotation(&lab_host, "vm-101", "power_status:poweredOn,in_ci_use:True")
        .await
        .unwrap();
    inventory.refresh(&client).await.unwrap();

    let index = inventory.instance_index("gw-1").unwrap();
    let host = inventory.host_of(&inventory.instances[index]).clone();
    let err = reserve::claim(&client, &host, &mut inventory.instances[index], "controller-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ReserveError::Conflict { holder: None }));
    // The tag must not have been overwritten.
    assert!(client.annotation_of("gw-1").contains("in_ci_use:True"));
    let available = inventory.available();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].spec.name, "gw-2");
}

#[tokio::test]
async fn release_clears_the_reservation() {
    let (client, mut inventory) = lab();
    inventory.refresh(&client).await.unwrap();

    let index = inventory.instance_index("gw-2").unwrap();
    let host = inventory.host_of(&inventory.instances[index]).clone();
    reserve::claim(&client, &host, &mut inventory.instances[index], "controller-1")
        .await
        .unwrap();
    reserve::release(&client, &host, &mut inventory.instances[index])
        .await
        .unwrap();

    inventory.refresh(&client).await.unwrap();
    assert!(inventory.instances[index].state.in_ci_use.is_free());
    assert_eq!(inventory.available().len(), 2);
}

#[tokio::test]
async fn golden_reset_reverts_and_powers_back_on() {
    let (client, mut inventory) = lab();
    inventory.refresh(&client).await.unwrap();

    let index = inventory.instance_index("gw-1").unwrap();
    let host = inventory.host_of(&inventory.instances[index]).clone();
    reserve::reset_to_golden(&client, &host, &mut inventory.instances[index], Some("golden"))
        .await
        .unwrap();

    let vms = client.vms.lock().unwrap();
    let vm = &vms["gw-1"];
    assert_eq!(vm.reverted_to.as_deref(), Some("snap-1"));
    // The revert left the VM powered off; the reset powers it back on.
    assert_eq!(vm.power, PowerStatus::PoweredOn);
}

#[tokio::test]
async fn missing_named_snapshot_is_an_error_not_a_no_op() {
    let (client, mut inventory) = lab();
    inventory.refresh(&client).await.unwrap();

    let index = inventory.instance_index("gw-1").unwrap();
    let host = inventory.host_of(&inventory.instances[index]).clone();
    let err = reserve::reset_to_golden(
        &client,
        &host,
        &mut inventory.instances[index],
        Some("no-such-snapshot"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ReserveError::SnapshotNotFound(_)));

    let vms = client.vms.lock().unwrap();
    assert_eq!(vms["gw-1"].reverted_to, None);
}

#[tokio::test]
async fn unnamed_reset_uses_the_current_snapshot() {
    let (client, mut inventory) = lab();
    inventory.refresh(&client).await.unwrap();

    let index = inventory.instance_index("gw-2").unwrap();
    let host = inventory.host_of(&inventory.instances[index]).clone();
    reserve::reset_to_golden(&client, &host, &mut inventory.instances[index], None)
        .await
        .unwrap();

    let vms = client.vms.lock().unwrap();
    assert_eq!(vms["gw-2"].reverted_to.as_deref(), Some("current"));
}

#[tokio::test]
async fn vanished_instance_fails_refresh() {
    let client = MockHostClient::new(
        vec![MockHostClient::vm("vm-101", PowerStatus::PoweredOn)],
        &["gw-1"],
    );
    let mut inventory = Inventory::parse(TOPOLOGY).unwrap();
    // gw-2 is declared in the topology but absent on the host.
    assert!(inventory.refresh(&client).await.is_err());
}

#[tokio::test]
async fn capture_and_remove_snapshot() {
    let (client, mut inventory) = lab();
    inventory.refresh(&client).await.unwrap();

    let index = inventory.instance_index("gw-1").unwrap();
    let host = inventory.host_of(&inventory.instances[index]).clone();
    let instance = inventory.instances[index].clone();

    reserve::capture_snapshot(&client, &host, &instance, "pre-upgrade")
        .await
        .unwrap();
    assert!(client.vms.lock().unwrap()["gw-1"]
        .snapshots
        .iter()
        .any(|s| s.name == "pre-upgrade"));

    reserve::remove_snapshot(&client, &host, &instance, "pre-upgrade")
        .await
        .unwrap();
    assert!(!client.vms.lock().unwrap()["gw-1"]
        .snapshots
        .iter()
        .any(|s| s.name == "pre-upgrade"));

    let err = reserve::remove_snapshot(&client, &host, &instance, "pre-upgrade")
        .await
        .unwrap_err();
    assert!(matches!(err, ReserveError::SnapshotNotFound(_)));
}
