//! Lifecycle flows: the ordered step sequences behind each `gwb` subcommand.
//!
//! Steps within a flow run strictly in order with sequential awaits. In the
//! claim and release flows any step failure is fatal and aborts the run; in
//! the validate flow each check catches its own failure so siblings still
//! run, and the aggregate verdict is written regardless.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use serde::Deserialize;

use gwbench_rs::host::HostClient;
use gwbench_rs::ipsec::IpsecStack;
use gwbench_rs::pool::{HostSpec, Inventory};
use gwbench_rs::reserve;
use gwbench_rs::verify::verify;

use crate::api::{ApiClient, GatewayApi, Session};
use crate::checks;
use crate::hostapi::HostAgentClient;
use crate::report::Report;
use crate::ssh;
use crate::{ClaimArgs, ReleaseArgs, ValidateArgs};

/// Settle delay after a device factory reset, before any further mutation.
const RESET_SETTLE: Duration = Duration::from_secs(90);
/// Settle delay between upgrade completion and the fresh login.
const RELOGIN_SETTLE: Duration = Duration::from_secs(10);

fn load_inventory(path: &Path) -> Result<Inventory> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pool topology {path:?}"))?;
    Ok(Inventory::parse(&raw)?)
}

/// Refreshes the inventory and resolves the target instance along with a
/// copy of its host entry.
async fn locate_instance(
    inventory: &mut Inventory,
    client: &dyn HostClient,
    name: &str,
) -> Result<(usize, HostSpec)> {
    inventory.refresh(client).await?;
    let index = inventory.instance_index(name)?;
    let host = inventory.host_of(&inventory.instances[index]).clone();
    Ok((index, host))
}

/// Claim flow: reserve the instance, factory-reset and upgrade the device,
/// then register it with the controller.
pub async fn run_claim(pool: &Path, args: &ClaimArgs) -> Result<()> {
    let device_api = ApiClient::new(&args.device.host)?;
    let host_client = HostAgentClient::new()?;
    let mut inventory = load_inventory(pool)?;
    claim_sequence(&device_api, &host_client, &mut inventory, args).await
}

/// The claim step sequence, over the abstract API and host clients.
async fn claim_sequence(
    device_api: &dyn GatewayApi,
    host_client: &dyn HostClient,
    inventory: &mut Inventory,
    args: &ClaimArgs,
) -> Result<()> {
    info!("step 1: log in to device {}", args.device.host);
    let session = device_api
        .login(&args.device.username, &args.device.password)
        .await?;

    // The claim is written before any remote mutation, so a crash mid-flow
    // leaves the instance visibly reserved instead of silently orphaned.
    info!("step 2: mark pool instance {} as reserved", args.device.name);
    let (index, host) = locate_instance(inventory, host_client, &args.device.name).await?;
    reserve::claim(
        host_client,
        &host,
        &mut inventory.instances[index],
        &args.controller.host,
    )
    .await?;

    info!("step 3: device-side factory reset");
    device_api.reset_to_factory(&session).await?;
    tokio::time::sleep(RESET_SETTLE).await;

    info!("step 4: upgrade device to {}", args.version);
    let session = device_api
        .login(&args.device.username, &args.device.password)
        .await?;
    device_api.trigger_upgrade(&session, &args.version).await?;
    let (username, password, version) = (
        args.device.username.as_str(),
        args.device.password.as_str(),
        args.version.as_str(),
    );
    let upgraded = verify("upgrade_complete", &checks::UPGRADE_COMPLETE, move || {
        checks::upgrade_complete(device_api, username, password, version)
    })
    .await?;
    if !upgraded {
        bail!(
            "device did not report version {} within {:?}",
            args.version,
            checks::UPGRADE_COMPLETE.budget()
        );
    }
    tokio::time::sleep(RELOGIN_SETTLE).await;

    info!("step 5: confirm installed version");
    // The upgrade invalidated the previous session.
    let session = device_api
        .login(&args.device.username, &args.device.password)
        .await?;
    let version_info = device_api.version_info(&session).await?;
    info!("device reports version {}", version_info.current_version);

    info!(
        "step 6: register {} with controller {}",
        args.device.name, args.controller.host
    );
    device_api
        .register_with_controller(
            &session,
            &args.controller.host,
            &args.controller.username,
            &args.controller.password,
            &args.device.name,
        )
        .await?;
    device_api.logout(&session).await.ok();
    Ok(())
}

/// Release flow: factory-reset the device from both sides, clear the
/// reservation, and revert the instance to its golden image.
pub async fn run_release(pool: &Path, args: &ReleaseArgs) -> Result<()> {
    info!("step 1: log in to device {}", args.device.host);
    let device_api = ApiClient::new(&args.device.host)?;
    let device_session = device_api
        .login(&args.device.username, &args.device.password)
        .await?;

    info!("step 2: device-side factory reset");
    device_api.reset_to_factory(&device_session).await?;

    info!(
        "step 3: factory reset from controller {}",
        args.controller.host
    );
    let controller_api = ApiClient::new(&args.controller.host)?;
    let controller_session = controller_api
        .login(&args.controller.username, &args.controller.password)
        .await?;
    controller_api
        .reset_managed_device(&controller_session, &args.device.name)
        .await?;

    info!("step 4: release pool instance {}", args.device.name);
    let host_client = HostAgentClient::new()?;
    let mut inventory = load_inventory(pool)?;
    let (index, host) = locate_instance(&mut inventory, &host_client, &args.device.name).await?;
    reserve::release(&host_client, &host, &mut inventory.instances[index]).await?;

    info!("step 5: revert {} to its golden image", args.device.name);
    // An empty --snapshot means "use the current snapshot".
    let snapshot = args.snapshot.as_deref().filter(|name| !name.is_empty());
    reserve::reset_to_golden(&host_client, &host, &mut inventory.instances[index], snapshot)
        .await?;

    // Invalidate the sessions before returning; the device one may already
    // be gone after the factory reset.
    controller_api.logout(&controller_session).await.ok();
    device_api.logout(&device_session).await.ok();
    Ok(())
}

/// Validate flow: independent checks against a registered device, each
/// recorded into the aggregate report.
pub async fn run_validate(args: &ValidateArgs) -> Result<&'static str> {
    let mut report = Report::new();

    let controller_api = ApiClient::new(&args.controller.host)?;
    let session = match controller_api
        .login(&args.controller.username, &args.controller.password)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            // Authentication is the one fatal step; still leave artifacts
            // behind so the pipeline sees a verdict.
            report.record("authenticate", Err(anyhow!("{e:#}")));
            report.write(&args.result, &args.report)?;
            return Err(e);
        }
    };

    let outcome = upgrade_gateway(&controller_api, &session, &args.device_name).await;
    report.record("upgrade_gateway", outcome);

    let outcome = diag_check(&controller_api, &session, args).await;
    report.record("site2cloud_diag", outcome);

    let outcome = tunnel_check(args).await;
    report.record("tunnel_convergence", outcome);

    let outcome = spoke_check(args);
    report.record("spoke_reachability", outcome);

    report.write(&args.result, &args.report)?;
    info!("validation verdict: {}", report.verdict());
    Ok(report.verdict())
}

/// Upgrades the gateway from the controller side and polls its status until
/// it is back up with the update complete.
async fn upgrade_gateway(api: &dyn GatewayApi, session: &Session, device_name: &str) -> Result<()> {
    api.upgrade_selected_gateway(session, device_name).await?;
    let healthy = verify("gateway_health", &checks::GATEWAY_HEALTH, move || {
        checks::gateway_healthy(api, session, device_name)
    })
    .await?;
    if !healthy {
        bail!("{device_name} status check failed after upgrade");
    }
    Ok(())
}

async fn diag_check(api: &dyn GatewayApi, session: &Session, args: &ValidateArgs) -> Result<()> {
    let up = verify("site2cloud_diag", &checks::DIAG, move || {
        checks::diag_connection_up(
            api,
            session,
            &args.vpc_id,
            &args.device_name,
            &args.conn_name,
        )
    })
    .await?;
    if !up {
        bail!("diagnostics did not report connection {:?} up", args.conn_name);
    }
    Ok(())
}

/// Device-side tunnel convergence: the device's own API session resolves the
/// IPsec stack, and an SSH shell counts established tunnels.
async fn tunnel_check(args: &ValidateArgs) -> Result<()> {
    let api_host = match args.device_api_port {
        Some(port) => format!("{}:{port}", args.device_host),
        None => args.device_host.clone(),
    };
    let device_api = ApiClient::new(&api_host)?;
    let session = device_api
        .login(&args.device_username, &args.device_password)
        .await?;
    info!("device api url: {}", device_api.endpoint());

    let shell = ssh::connect_password(
        &args.device_host,
        args.device_ssh_port,
        &args.device_ssh_username,
        &args.device_ssh_password,
    )?;

    let version_info = device_api.version_info(&session).await?;
    let stack = IpsecStack::from_kernel_version(&version_info.kernel_version).ok_or_else(|| {
        anyhow!(
            "no known IPsec stack for kernel version {:?}",
            version_info.kernel_version
        )
    })?;
    info!(
        "{}: kernel {} runs {}",
        args.device_name, version_info.kernel_version, stack
    );

    let shell_ref = &shell;
    let (device_name, expected) = (args.device_name.as_str(), args.expected_tunnels);
    let converged = verify(
        "tunnel_convergence",
        &checks::TUNNEL_CONVERGENCE,
        move || {
            let attempt = checks::tunnels_converged(shell_ref, stack, device_name, expected);
            async move { attempt }
        },
    )
    .await?;
    if !converged {
        bail!("site-to-cloud tunnels did not converge on {device_name}");
    }
    Ok(())
}

/// Reachability probe from the spoke VM towards the on-premises address.
fn spoke_check(args: &ValidateArgs) -> Result<()> {
    let shell = ssh::connect_key(&args.spoke_host, 22, &args.spoke_username, &args.spoke_key)?;
    let command = format!("fping {} -q -i 1 -r 3 -u -x 1", args.onprem_ip);
    let line = ssh::first_output_line(&shell, &command)?;
    info!("spoke reachability probe: {line}");
    if line.contains("Target IP Unreachable") {
        bail!(
            "on-prem address {} unreachable from the spoke",
            args.onprem_ip
        );
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct FindRequest {
    controller_hostname: String,
}

/// Reads a JSON trigger from stdin and prints, as a flat string map, the
/// declared attributes of the instance already bound to that controller, or
/// of the first free instance.
pub async fn run_find(pool: &Path) -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read trigger input")?;
    let request: FindRequest =
        serde_json::from_str(&input).context("trigger input is not valid JSON")?;

    let host_client = HostAgentClient::new()?;
    let mut inventory = load_inventory(pool)?;
    inventory.refresh(&host_client).await?;

    let bound = inventory.instances.iter().find(|instance| {
        instance
            .state
            .in_ci_use
            .owner()
            .is_some_and(|owner| owner.contains(&request.controller_hostname))
    });
    let instance = match bound {
        Some(instance) => instance,
        None => *inventory.available().first().ok_or_else(|| {
            anyhow!(
                "no instance is bound to {} and none are free",
                request.controller_hostname
            )
        })?,
    };

    let mut attributes = BTreeMap::new();
    attributes.insert("name", instance.spec.name.clone());
    attributes.insert("address", instance.spec.address.clone());
    attributes.insert("host", instance.spec.host.clone());
    if let Some(id) = instance.spec.id.clone().or_else(|| instance.live_id.clone()) {
        attributes.insert("id", id);
    }
    println!("{}", serde_json::to_string(&attributes)?);
    Ok(())
}
