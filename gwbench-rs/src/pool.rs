//! Static pool topology and live inventory state.
//!
//! The topology (hosts, instances, addresses, credentials) is declared once
//! in a TOML file and loaded at startup; [`Inventory::refresh`] then overlays
//! the live power and reservation state read from each instance's host.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::{HostClient, HostError};
use crate::tag::{self, PowerStatus, State};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no {kind} named {name:?} in the pool topology")]
    NotFound { kind: &'static str, name: String },

    #[error("{count} {kind} entries named {name:?} in the pool topology")]
    Ambiguous {
        kind: &'static str,
        name: String,
        count: usize,
    },

    #[error("instance {instance:?} references unknown host {host:?}")]
    UnknownHost { instance: String, host: String },

    #[error("failed to parse pool topology: {0}")]
    Parse(#[from] toml::de::Error),

    /// The host no longer reports a VM for a declared instance. This is pool
    /// misconfiguration, fatal and never retried.
    #[error("instance {0:?} is declared in the topology but missing on its host")]
    InstanceVanished(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

/// One hypervisor host entry of the topology.
#[derive(Debug, Clone, Deserialize)]
pub struct HostSpec {
    pub name: String,
    pub address: String,
    #[serde(default = "default_host_username")]
    pub username: String,
    pub password: String,
}

fn default_host_username() -> String {
    "root".to_string()
}

/// One pool instance entry of the topology. The identity fields are
/// immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    /// Stable id, if declared; otherwise learned from the host on refresh.
    #[serde(default)]
    pub id: Option<String>,
    pub address: String,
    /// Name of the host this instance runs on.
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub instances: Vec<InstanceSpec>,
}

/// A reservable appliance instance, with its live state overlay.
#[derive(Debug, Clone)]
pub struct PoolInstance {
    pub spec: InstanceSpec,
    /// Index of this instance's host in [`Inventory::hosts`].
    pub host: usize,
    /// Id reported by the host on the last refresh.
    pub live_id: Option<String>,
    pub state: State,
}

#[derive(Debug)]
pub struct Inventory {
    pub hosts: Vec<HostSpec>,
    pub instances: Vec<PoolInstance>,
}

impl Inventory {
    /// Builds the inventory from a parsed topology, resolving each
    /// instance's host reference. No live system is contacted.
    pub fn load(config: PoolConfig) -> Result<Inventory, PoolError> {
        let hosts = config.hosts;
        let mut instances = Vec::with_capacity(config.instances.len());
        for spec in config.instances {
            let host = hosts
                .iter()
                .position(|h| h.name == spec.host)
                .ok_or_else(|| PoolError::UnknownHost {
                    instance: spec.name.clone(),
                    host: spec.host.clone(),
                })?;
            instances.push(PoolInstance {
                spec,
                host,
                live_id: None,
                state: State::default(),
            });
        }
        Ok(Inventory { hosts, instances })
    }

    /// Parses a TOML topology document and builds the inventory.
    pub fn parse(raw: &str) -> Result<Inventory, PoolError> {
        Inventory::load(toml::from_str(raw)?)
    }

    /// Re-reads power and tag state for every tracked instance from its
    /// host. A declared instance missing on its host aborts the refresh.
    pub async fn refresh(&mut self, client: &dyn HostClient) -> Result<(), PoolError> {
        let Inventory { hosts, instances } = self;
        for instance in instances.iter_mut() {
            let host = &hosts[instance.host];
            let vm = match client.find_vm(host, &instance.spec.name).await {
                Ok(vm) => vm,
                Err(HostError::VmNotFound(_)) => {
                    return Err(PoolError::InstanceVanished(instance.spec.name.clone()));
                }
                Err(e) => return Err(e.into()),
            };
            instance.live_id = Some(vm.id);
            tag::decode(&vm.annotation, &mut instance.state);
            instance.state.power_status = vm.power;
        }
        Ok(())
    }

    /// Returns the unique instance with the given declared name. Zero or
    /// multiple matches is a configuration error.
    pub fn instance(&self, name: &str) -> Result<&PoolInstance, PoolError> {
        let index = self.instance_index(name)?;
        Ok(&self.instances[index])
    }

    /// Index variant of [`Inventory::instance`], for callers that need the
    /// instance mutably alongside its host entry.
    pub fn instance_index(&self, name: &str) -> Result<usize, PoolError> {
        unique_match("instance", name, self.instances.iter().enumerate(), |(_, i)| {
            i.spec.name == name
        })
        .map(|(index, _)| index)
    }

    /// Returns the unique host with the given name.
    pub fn host(&self, name: &str) -> Result<&HostSpec, PoolError> {
        unique_match("host", name, self.hosts.iter(), |h| h.name == name)
    }

    /// The host a given instance runs on.
    pub fn host_of(&self, instance: &PoolInstance) -> &HostSpec {
        &self.hosts[instance.host]
    }

    /// Instances available for CI use, in inventory order: powered on and
    /// not reserved. The first entry is the convention for "pick one".
    pub fn available(&self) -> Vec<&PoolInstance> {
        self.instances
            .iter()
            .filter(|i| {
                i.state.power_status == PowerStatus::PoweredOn && i.state.in_ci_use.is_free()
            })
            .collect()
    }
}

fn unique_match<T>(
    kind: &'static str,
    name: &str,
    candidates: impl Iterator<Item = T>,
    matches: impl Fn(&T) -> bool,
) -> Result<T, PoolError> {
    let mut found: Vec<T> = candidates.filter(|c| matches(c)).collect();
    match found.len() {
        0 => Err(PoolError::NotFound {
            kind,
            name: name.to_string(),
        }),
        1 => Ok(found.remove(0)),
        count => Err(PoolError::Ambiguous {
            kind,
            name: name.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagValue;

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
        id = "vm-202"
        address = "10.0.1.2"
        host = "lab-host-1"
    "#;

    #[test]
    fn load_resolves_host_references() {
        let inventory = Inventory::parse(TOPOLOGY).unwrap();
        assert_eq!(inventory.instances.len(), 2);
        assert_eq!(inventory.host_of(&inventory.instances[1]).name, "lab-host-1");
        assert_eq!(inventory.hosts[0].username, "root");
        assert_eq!(inventory.instances[1].spec.id.as_deref(), Some("vm-202"));
    }

    #[test]
    fn unknown_host_reference_is_a_config_error() {
        let raw = r#"
            [[instances]]
            name = "gw-1"
            address = "10.0.1.1"
            host = "nonexistent"
        "#;
        assert!(matches!(
            Inventory::parse(raw),
            Err(PoolError::UnknownHost { .. })
        ));
    }

    #[test]
    fn find_surfaces_missing_and_duplicate_names() {
        let inventory = Inventory::parse(TOPOLOGY).unwrap();
        assert!(matches!(
            inventory.instance("gw-9"),
            Err(PoolError::NotFound { kind: "instance", .. })
        ));

        let mut duplicated = Inventory::parse(TOPOLOGY).unwrap();
        let copy = duplicated.instances[0].clone();
        duplicated.instances.push(copy);
        assert!(matches!(
            duplicated.instance("gw-1"),
            Err(PoolError::Ambiguous { count: 2, .. })
        ));
    }

    #[test]
    fn available_filters_power_and_reservation() {
        let mut inventory = Inventory::parse(TOPOLOGY).unwrap();
        inventory.instances[0].state = State {
            power_status: PowerStatus::PoweredOn,
            in_ci_use: TagValue::Bool(false),
        };
        inventory.instances[1].state = State {
            power_status: PowerStatus::PoweredOn,
            in_ci_use: TagValue::Text("controller-1".to_string()),
        };
        let available = inventory.available();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].spec.name, "gw-1");

        inventory.instances[0].state.power_status = PowerStatus::PoweredOff;
        assert!(inventory.available().is_empty());
    }
}
