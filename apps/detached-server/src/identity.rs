//! VM self-identity: explicit flags first, instance metadata second.

use azure_rest::InstanceMetadata;
use domain_detached::DetachedVm;
use serde_json::Value;
use tracing::warn;

/// Resolve the identity served by `GET /cofii/detached/vm`.
///
/// Any field given on the command line wins; the rest comes from IMDS. Off
/// Azure (no IMDS), missing fields degrade to loopback placeholders so local
/// runs still work.
pub async fn resolve(
    vm_name: Option<String>,
    subscription: Option<String>,
    resource_group: Option<String>,
    ip: Option<String>,
) -> DetachedVm {
    let need_imds =
        vm_name.is_none() || subscription.is_none() || resource_group.is_none() || ip.is_none();

    let instance = if need_imds {
        match InstanceMetadata::default().instance().await {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(error = %e, "Instance metadata unavailable, using placeholders");
                None
            }
        }
    } else {
        None
    };

    let compute = |field: &str| -> Option<String> {
        instance
            .as_ref()?
            .pointer(&format!("/compute/{field}"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let private_ip = || -> Option<String> {
        instance
            .as_ref()?
            .pointer("/network/interface/0/ipv4/ipAddress/0/privateIpAddress")
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    DetachedVm {
        name: vm_name
            .or_else(|| compute("name"))
            .unwrap_or_else(|| "localhost".to_string()),
        ip: ip.or_else(private_ip).unwrap_or_else(|| "127.0.0.1".to_string()),
        subscriptionid: subscription
            .or_else(|| compute("subscriptionId"))
            .unwrap_or_default(),
        resourcegroup: resource_group
            .or_else(|| compute("resourceGroupName"))
            .unwrap_or_default(),
    }
}
