//! Verification predicates for the lifecycle flows, each one poll attempt
//! against a remote system, run under [`gwbench_rs::verify::verify`].
//!
//! The retry policies are per call site: they encode how long the remote
//! operation is expected to take, not a shared constant.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info};

use gwbench_rs::ipsec::IpsecStack;
use gwbench_rs::verify::RetryPolicy;

use crate::api::{GatewayApi, GatewayInfo, Session};
use crate::ssh;

/// Gateway health after a controller-side upgrade.
pub const GATEWAY_HEALTH: RetryPolicy = RetryPolicy::new(20, Duration::from_secs(15));
/// Site-to-cloud tunnel convergence.
pub const TUNNEL_CONVERGENCE: RetryPolicy = RetryPolicy::new(8, Duration::from_secs(60));
/// Device answering again with the requested version after an upgrade.
pub const UPGRADE_COMPLETE: RetryPolicy = RetryPolicy::new(24, Duration::from_secs(30));
/// Diagnostics is a one-shot check, wrapped in the verifier for consistency.
pub const DIAG: RetryPolicy = RetryPolicy::new(1, Duration::ZERO);

/// Verdict over one gateway status listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayHealth {
    /// Connectivity up and the update complete.
    Ready,
    /// Listed, but still coming up or mid-update.
    Pending,
    /// Not present in the listing at all.
    Absent,
}

/// Pure decision behind [`gateway_healthy`]: what one listing says about
/// `device_name`.
pub fn gateway_health(gateways: &[GatewayInfo], device_name: &str) -> GatewayHealth {
    match gateways.iter().find(|gw| gw.name == device_name) {
        None => GatewayHealth::Absent,
        Some(gw) if gw.vpc_state == "up" && gw.update_status == "complete" => GatewayHealth::Ready,
        Some(gw) => {
            debug!(
                "{}: vpc_state: {}, update_status: {}",
                gw.name, gw.vpc_state, gw.update_status
            );
            GatewayHealth::Pending
        }
    }
}

/// One gateway-health poll: the target must be listed with its connectivity
/// up and its update complete. The target being absent from the listing is a
/// hard error, not a retry condition; a timed-out poll is one failed
/// attempt.
pub async fn gateway_healthy(
    api: &dyn GatewayApi,
    session: &Session,
    device_name: &str,
) -> Result<bool> {
    let Some(gateways) = api.gateway_upgrade_status(session).await? else {
        return Ok(false);
    };
    match gateway_health(&gateways, device_name) {
        GatewayHealth::Ready => Ok(true),
        GatewayHealth::Pending => Ok(false),
        GatewayHealth::Absent => {
            bail!("{device_name} does not exist in the gateway status listing")
        }
    }
}

/// One tunnel-convergence check over an established SSH session to the
/// device shell. The acceptance threshold is the stack's policy.
pub fn tunnels_converged(
    session: &ssh2::Session,
    stack: IpsecStack,
    device_name: &str,
    expected: u32,
) -> Result<bool> {
    let line = ssh::first_output_line(session, stack.count_command())?;
    let count: u32 = line
        .parse()
        .with_context(|| format!("unexpected tunnel count output {line:?}"))?;
    let required = stack.required_tunnels(expected);
    info!("{device_name}: {stack} reports {count}/{expected} site-to-cloud tunnels");
    if count >= required {
        return Ok(true);
    }
    error!(
        "established tunnels not enough: required {required}/{expected}, currently {count}/{expected}"
    );
    Ok(false)
}

/// One site-to-cloud diagnostics check: the analysis text must report the
/// connection up.
pub async fn diag_connection_up(
    api: &dyn GatewayApi,
    session: &Session,
    vpc_id: &str,
    gateway_name: &str,
    connection_name: &str,
) -> Result<bool> {
    let text = api
        .run_site2cloud_diag(session, vpc_id, gateway_name, connection_name)
        .await?;
    debug!("diagnostics analysis: {text}");
    Ok(text.contains(&format!("{connection_name} is UP")))
}

/// One upgrade-completion check: a fresh login succeeds and the device
/// reports the requested version. The device drops sessions and goes
/// unreachable mid-upgrade, so every failure here is one failed attempt.
pub async fn upgrade_complete(
    api: &dyn GatewayApi,
    username: &str,
    password: &str,
    version: &str,
) -> Result<bool> {
    let session = match api.login(username, password).await {
        Ok(session) => session,
        Err(e) => {
            debug!("device not answering logins yet: {e:#}");
            return Ok(false);
        }
    };
    let info = match api.version_info(&session).await {
        Ok(info) => info,
        Err(e) => {
            debug!("device not reporting version info yet: {e:#}");
            return Ok(false);
        }
    };
    api.logout(&session).await.ok();
    debug!("device reports version {}", info.current_version);
    Ok(info.current_version.contains(version))
}
