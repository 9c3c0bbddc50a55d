//! Client for the `action`-keyed REST API exposed by both the cloud
//! controller and the device itself.
//!
//! Every call goes to a single `https://{host}/v1/api` endpoint with
//! form-encoded fields keyed by `action` and comes back as a JSON envelope
//! `{return, CID?, results, reason?}`. An HTTP status outside 200-206 or
//! `return == false` is uniformly a failure. Appliance endpoints ship
//! self-signed certificates, so TLS verification is disabled.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

/// Per-call timeout applied to polled checks so that one unreachable attempt
/// does not stall the whole retry budget.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON envelope of every controller/device API response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse {
    #[serde(rename = "return")]
    pub success: bool,
    #[serde(rename = "CID", default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub results: Value,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Opaque authentication handle scoped to one endpoint. Sessions expire
/// server-side without notice; long-running flows re-login after steps that
/// can invalidate them (upgrade, factory reset).
#[derive(Debug, Clone)]
pub struct Session {
    pub cid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub current_version: String,
    #[serde(default)]
    pub kernel_version: String,
}

/// Per-gateway entry of the controller's upgrade status listing.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayInfo {
    pub name: String,
    #[serde(default)]
    pub vpc_state: String,
    #[serde(default)]
    pub update_status: String,
}

#[derive(Debug, Deserialize)]
struct GatewayStatusResults {
    #[serde(default)]
    gw_info: Vec<GatewayInfo>,
}

/// The operation surface of the controller/device API, as the lifecycle
/// flows consume it. [`ApiClient`] is the wire implementation; tests drive
/// the flows through in-memory implementations.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// Logs in and returns the session CID.
    async fn login(&self, username: &str, password: &str) -> Result<Session>;

    async fn logout(&self, session: &Session) -> Result<()>;

    /// Registers the device this client points at with a controller.
    async fn register_with_controller(
        &self,
        session: &Session,
        controller_host: &str,
        username: &str,
        password: &str,
        gateway_name: &str,
    ) -> Result<()>;

    /// Device-side factory reset, issued against the device itself.
    async fn reset_to_factory(&self, session: &Session) -> Result<()>;

    /// Controller-initiated factory reset of a managed device.
    async fn reset_managed_device(&self, session: &Session, device_name: &str) -> Result<()>;

    /// Triggers a device software upgrade. Completion is confirmed
    /// separately by polling.
    async fn trigger_upgrade(&self, session: &Session, version: &str) -> Result<()>;

    async fn version_info(&self, session: &Session) -> Result<VersionInfo>;

    /// Asynchronously upgrades one gateway to the latest software from the
    /// controller side.
    async fn upgrade_selected_gateway(&self, session: &Session, gateway_name: &str) -> Result<()>;

    /// One poll of the controller's gateway upgrade status listing. `None`
    /// means the attempt timed out.
    async fn gateway_upgrade_status(&self, session: &Session) -> Result<Option<Vec<GatewayInfo>>>;

    /// Runs the site-to-cloud diagnostic analysis for one connection and
    /// returns the analysis text.
    async fn run_site2cloud_diag(
        &self,
        session: &Session,
        vpc_id: &str,
        gateway_name: &str,
        connection_name: &str,
    ) -> Result<String>;
}

pub struct ApiClient {
    client: Client,
    api_url: String,
}

impl ApiClient {
    /// `host` is a hostname or IP, optionally with an explicit port.
    pub fn new(host: &str) -> Result<ApiClient> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build HTTP client")?;
        Ok(ApiClient {
            client,
            api_url: format!("https://{host}/v1/api"),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.api_url
    }

    fn check(action: &str, status: StatusCode, body: ApiResponse) -> Result<ApiResponse> {
        if !(200..=206).contains(&status.as_u16()) {
            bail!("{action}: unexpected HTTP status {status}");
        }
        if !body.success {
            let detail = body
                .reason
                .clone()
                .unwrap_or_else(|| body.results.to_string());
            bail!("{action}: rejected by the API: {detail}");
        }
        Ok(body)
    }

    async fn post_action(&self, action: &str, fields: &[(&str, &str)]) -> Result<ApiResponse> {
        let mut form: Vec<(&str, &str)> = vec![("action", action)];
        form.extend_from_slice(fields);
        debug!("POST {} action={action}", self.api_url);
        let response = self
            .client
            .post(&self.api_url)
            .form(&form)
            .send()
            .await
            .with_context(|| format!("{action}: request to {} failed", self.api_url))?;
        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .with_context(|| format!("{action}: invalid response body"))?;
        debug!("{action}: results: {}", body.results);
        Self::check(action, status, body)
    }
}

#[async_trait]
impl GatewayApi for ApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let payload = [
            ("action", "login"),
            ("username", username),
            ("password", password),
        ];
        let response = self
            .client
            .get(&self.api_url)
            .query(&payload)
            .send()
            .await
            .with_context(|| format!("login: request to {} failed", self.api_url))?;
        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .context("login: invalid response body")?;
        let body = Self::check("login", status, body)?;
        let cid = body
            .cid
            .ok_or_else(|| anyhow!("login: no CID in response"))?;
        info!("acquired CID for {}", self.api_url);
        Ok(Session { cid })
    }

    async fn logout(&self, session: &Session) -> Result<()> {
        self.post_action("logout", &[("CID", &session.cid)]).await?;
        Ok(())
    }

    async fn register_with_controller(
        &self,
        session: &Session,
        controller_host: &str,
        username: &str,
        password: &str,
        gateway_name: &str,
    ) -> Result<()> {
        let body = self
            .post_action(
                "register_device_with_controller",
                &[
                    ("CID", &session.cid),
                    ("controller_ip_or_fqdn", controller_host),
                    ("username", username),
                    ("password", password),
                    ("gateway_name", gateway_name),
                ],
            )
            .await?;
        info!("register result: {}", body.results);
        Ok(())
    }

    async fn reset_to_factory(&self, session: &Session) -> Result<()> {
        let body = self
            .post_action("reset_device_to_factory_state", &[("CID", &session.cid)])
            .await?;
        info!("factory reset result: {}", body.results);
        Ok(())
    }

    async fn reset_managed_device(
        &self,
        session: &Session,
        device_name: &str,
    ) -> Result<()> {
        let body = self
            .post_action(
                "reset_managed_device_to_factory_state",
                &[("CID", &session.cid), ("device_name", device_name)],
            )
            .await?;
        info!("controller-side reset result: {}", body.results);
        Ok(())
    }

    /// Triggers a device software upgrade. The device frequently does not
    /// answer before the upgrade takes effect, so a timeout on this call is
    /// swallowed; completion is confirmed separately by polling.
    async fn trigger_upgrade(&self, session: &Session, version: &str) -> Result<()> {
        let form = [
            ("action", "upgrade"),
            ("CID", &session.cid),
            ("version", version),
        ];
        match self
            .client
            .post(&self.api_url)
            .form(&form)
            .timeout(POLL_TIMEOUT)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_timeout() => {
                debug!("upgrade trigger timed out, device is likely already upgrading");
                Ok(())
            }
            Err(e) => Err(e).context("upgrade: request failed"),
        }
    }

    async fn version_info(&self, session: &Session) -> Result<VersionInfo> {
        let body = self
            .post_action("list_version_info", &[("CID", &session.cid)])
            .await?;
        serde_json::from_value(body.results).context("list_version_info: unexpected results shape")
    }

    async fn upgrade_selected_gateway(
        &self,
        session: &Session,
        gateway_name: &str,
    ) -> Result<()> {
        self.post_action(
            "upgrade_selected_gateway",
            &[
                ("CID", &session.cid),
                ("software_version", "latest"),
                ("force_upgrade", "false"),
                ("async", "true"),
                ("gateway_list", gateway_name),
            ],
        )
        .await?;
        Ok(())
    }

    /// One poll of the controller's gateway upgrade status listing, with the
    /// short per-call timeout. `None` means the attempt timed out.
    async fn gateway_upgrade_status(
        &self,
        session: &Session,
    ) -> Result<Option<Vec<GatewayInfo>>> {
        let payload = [
            ("action", "list_gateway_upgrade_status"),
            ("CID", &session.cid),
        ];
        let response = match self
            .client
            .get(&self.api_url)
            .query(&payload)
            .timeout(POLL_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Ok(None),
            Err(e) => return Err(e).context("list_gateway_upgrade_status: request failed"),
        };
        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .context("list_gateway_upgrade_status: invalid response body")?;
        let body = Self::check("list_gateway_upgrade_status", status, body)?;
        let results: GatewayStatusResults = serde_json::from_value(body.results)
            .context("list_gateway_upgrade_status: unexpected results shape")?;
        Ok(Some(results.gw_info))
    }

    async fn run_site2cloud_diag(
        &self,
        session: &Session,
        vpc_id: &str,
        gateway_name: &str,
        connection_name: &str,
    ) -> Result<String> {
        let body = self
            .post_action(
                "run_site2cloud_diag",
                &[
                    ("CID", &session.cid),
                    ("vpc_id", vpc_id),
                    ("gateway_name", gateway_name),
                    ("action_name", "run_analysis"),
                    ("connection_name", connection_name),
                ],
            )
            .await?;
        Ok(match body.results {
            Value::String(text) => text,
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_envelope_parses() {
        let body: ApiResponse = serde_json::from_str(
            r#"{"return": true, "CID": "abc123", "results": {"current_version": "6.8.1148"}}"#,
        )
        .unwrap();
        assert!(body.success);
        assert_eq!(body.cid.as_deref(), Some("abc123"));

        let info: VersionInfo = serde_json::from_value(body.results).unwrap();
        assert_eq!(info.current_version, "6.8.1148");
        assert_eq!(info.kernel_version, "");
    }

    #[test]
    fn rejection_parses_without_cid() {
        let body: ApiResponse =
            serde_json::from_str(r#"{"return": false, "reason": "bad credentials"}"#).unwrap();
        assert!(!body.success);
        assert_eq!(body.cid, None);
        assert_eq!(body.reason.as_deref(), Some("bad credentials"));
    }

    #[test]
    fn gateway_status_listing_parses() {
        let results: GatewayStatusResults = serde_json::from_str(
            r#"{"gw_info": [
                {"name": "gw-1", "vpc_state": "up", "update_status": "complete"},
                {"name": "gw-2", "vpc_state": "down", "update_status": "in_progress"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(results.gw_info.len(), 2);
        assert_eq!(results.gw_info[0].vpc_state, "up");
        assert_eq!(results.gw_info[1].update_status, "in_progress");
    }

    #[test]
    fn status_check_rejects_http_errors_and_api_rejections() {
        let ok = ApiResponse {
            success: true,
            cid: None,
            results: Value::Null,
            reason: None,
        };
        assert!(ApiClient::check("t", StatusCode::PARTIAL_CONTENT, ok.clone()).is_ok());
        assert!(ApiClient::check("t", StatusCode::INTERNAL_SERVER_ERROR, ok.clone()).is_err());

        let rejected = ApiResponse {
            success: false,
            ..ok
        };
        assert!(ApiClient::check("t", StatusCode::OK, rejected).is_err());
    }
}
