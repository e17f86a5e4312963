//! Core-quota checks for a VM family, regular and spot pools.

use crate::error::{ScaleSetError, ScaleSetResult};
use azure_rest::AzureClient;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// How long to wait between quota polls while a request does not fit.
pub const QUOTA_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Cores left in each pool after subtracting the request.
#[derive(Clone, Copy, Debug)]
pub struct Quota {
    pub available_regular: i64,
    pub available_spot: i64,
}

impl Quota {
    pub fn available(&self, spot: bool) -> i64 {
        if spot {
            self.available_spot
        } else {
            self.available_regular
        }
    }
}

fn usage_available(usages: &[Value], family: &str, requested_cores: i64) -> i64 {
    usages
        .iter()
        .find(|u| {
            u.pointer("/name/value").and_then(Value::as_str) == Some(family)
        })
        .map(|u| {
            let limit = u.get("limit").and_then(Value::as_i64).unwrap_or(0);
            let current = u.get("currentValue").and_then(Value::as_i64).unwrap_or(0);
            limit - current - requested_cores
        })
        .unwrap_or(0)
}

/// Compare the family quota in `location` against a request for `nrequested`
/// machines of `sku_name`.
pub async fn quota_check(
    client: &AzureClient,
    subscription: &str,
    location: &str,
    sku_name: &str,
    nrequested: i64,
) -> ScaleSetResult<Quota> {
    let filter = urlencoding::encode(&format!("location eq '{location}'")).into_owned();
    let skus_url = client.url(&format!(
        "/subscriptions/{subscription}/providers/Microsoft.Compute/skus?api-version=2019-04-01&$filter={filter}"
    ));
    let skus = client.get_paged(&skus_url).await?;

    let sku = skus
        .iter()
        .find(|s| s.get("name").and_then(Value::as_str) == Some(sku_name))
        .ok_or_else(|| ScaleSetError::Template(format!("unknown machine SKU '{sku_name}'")))?;

    let family = sku
        .get("family")
        .and_then(Value::as_str)
        .ok_or_else(|| ScaleSetError::Template(format!("SKU '{sku_name}' has no family")))?;
    let vcpus: i64 = sku
        .get("capabilities")
        .and_then(Value::as_array)
        .and_then(|caps| {
            caps.iter()
                .find(|c| c.get("name").and_then(Value::as_str) == Some("vCPUs"))
        })
        .and_then(|c| c.get("value").and_then(Value::as_str))
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ScaleSetError::Template(format!("SKU '{sku_name}' has no vCPUs")))?;

    let usages_url = client.url(&format!(
        "/subscriptions/{subscription}/providers/Microsoft.Compute/locations/{location}/usages?api-version=2019-07-01"
    ));
    let usages = client.get_paged(&usages_url).await?;

    let requested_cores = nrequested * vcpus;
    Ok(Quota {
        available_regular: usage_available(&usages, family, requested_cores),
        available_spot: usage_available(&usages, "lowPriorityCores", requested_cores),
    })
}

/// Block until the requested machines fit the quota of their priority pool,
/// polling every [`QUOTA_POLL_INTERVAL`]. Interruptible through `interrupt`.
pub async fn wait_for_quota(
    client: &AzureClient,
    subscription: &str,
    location: &str,
    sku_name: &str,
    nrequested: i64,
    spot: bool,
    interrupt: &mut watch::Receiver<bool>,
) -> ScaleSetResult<()> {
    loop {
        if *interrupt.borrow() {
            return Err(ScaleSetError::Interrupted);
        }

        let quota = quota_check(client, subscription, location, sku_name, nrequested).await?;
        let available = quota.available(spot);
        if available >= 0 {
            info!(sku_name, nrequested, spot, available, "Quota check passed");
            return Ok(());
        }

        warn!(
            sku_name,
            nrequested,
            spot,
            deficit = -available,
            "Insufficient quota, waiting"
        );

        tokio::select! {
            _ = tokio::time::sleep(QUOTA_POLL_INTERVAL) => {}
            _ = interrupt.changed() => {
                if *interrupt.borrow() {
                    return Err(ScaleSetError::Interrupted);
                }
            }
        }
    }
}
