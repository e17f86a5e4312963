//! The scale-set reconciler: create or grow a VMSS to a target capacity.

use crate::cloudinit::encode_custom_data;
use crate::error::{ScaleSetError, ScaleSetResult};
use crate::quota::wait_for_quota;
use crate::templates::{add_public_key, ensure_object_path, TemplateKind};
use azure_rest::AzureClient;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::info;

const SCALESET_API_VERSION: &str = "2019-12-01";
const INSTANCE_API_VERSION: &str = "2018-06-01";
const SCALESET_NIC_API_VERSION: &str = "2017-03-30";

/// Identity of a managed scale set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScaleSetKey {
    pub subscription: String,
    pub resource_group: String,
    pub scale_set: String,
}

impl ScaleSetKey {
    pub fn new(
        subscription: impl Into<String>,
        resource_group: impl Into<String>,
        scale_set: impl Into<String>,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            resource_group: resource_group.into(),
            scale_set: scale_set.into(),
        }
    }

    fn resource_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}",
            self.subscription, self.resource_group, self.scale_set
        )
    }

}

/// Knobs for one reconcile call beyond the template itself.
#[derive(Clone, Debug)]
pub struct ScaleSetOptions {
    /// Unix user whose `authorized_keys` receives the master's public key.
    pub user: String,
    /// Master public key material (`ssh-rsa ...`).
    pub public_key: String,
    /// Rendered first-boot script (plain text; encoded here).
    pub startup_script: String,
    pub spot: bool,
    /// Spot price ceiling; -1.0 buys at the market price.
    pub max_price: f64,
}

/// List every scale set in the resource group (paged).
pub async fn list_scalesets(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
) -> ScaleSetResult<Vec<Value>> {
    let url = client.url(&format!(
        "/subscriptions/{subscription}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachineScaleSets?api-version={SCALESET_API_VERSION}"
    ));
    Ok(client.get_paged(&url).await?)
}

fn capacity_of(scaleset: &Value) -> i64 {
    scaleset
        .pointer("/sku/capacity")
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn random_prefix(scale_set: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..4)
        .map(|_| rng.random_range(b'a'..=b'z') as char)
        .collect();
    format!("{scale_set}-{suffix}-")
}

/// Create the scale set or grow it by `delta` instances, returning the new
/// target capacity.
///
/// A missing scale set is first PUT with `sku.capacity = 0` so the resource
/// exists before any instance is requested; the quota loop then gates the
/// capacity PUT. An existing scale set keeps its computer-name prefix so
/// host names stay in one family across scale-ups.
pub async fn scaleset_create_or_update(
    client: &AzureClient,
    key: &ScaleSetKey,
    delta: i64,
    template: &Value,
    opts: &ScaleSetOptions,
    interrupt: &mut watch::Receiver<bool>,
) -> ScaleSetResult<i64> {
    let existing = list_scalesets(client, &key.subscription, &key.resource_group)
        .await?
        .into_iter()
        .find(|s| s.get("name").and_then(Value::as_str) == Some(key.scale_set.as_str()));

    let mut scaleset = template.clone();
    scaleset["name"] = Value::String(key.scale_set.clone());

    let prefix = existing
        .as_ref()
        .and_then(|s| {
            s.pointer("/properties/virtualMachineProfile/osProfile/computerNamePrefix")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| random_prefix(&key.scale_set));
    let os_profile = ensure_object_path(
        &mut scaleset,
        &["properties", "virtualMachineProfile", "osProfile"],
    );
    os_profile["computerNamePrefix"] = Value::String(prefix);

    add_public_key(
        &mut scaleset,
        TemplateKind::ScaleSet,
        &opts.user,
        &opts.public_key,
    );

    let os_profile = ensure_object_path(
        &mut scaleset,
        &["properties", "virtualMachineProfile", "osProfile"],
    );
    os_profile["customData"] = Value::String(encode_custom_data(&opts.startup_script));

    if opts.spot {
        let profile = ensure_object_path(&mut scaleset, &["properties", "virtualMachineProfile"]);
        profile["priority"] = json!("Spot");
        profile["evictionPolicy"] = json!("Delete");
        profile["billingProfile"] = json!({"maxPrice": opts.max_price});
    }

    let url = client.url(&format!(
        "{}?api-version={SCALESET_API_VERSION}",
        key.resource_path()
    ));

    let current = match &existing {
        Some(existing) => capacity_of(existing),
        None => {
            // Create the resource with no instances; capacity comes after the
            // quota gate below.
            ensure_object_path(&mut scaleset, &["sku"])["capacity"] = json!(0);
            info!(scale_set = %key.scale_set, "Creating scale set");
            client.put(&url, &scaleset).await?;
            0
        }
    };

    let sku_name = scaleset
        .pointer("/sku/name")
        .and_then(Value::as_str)
        .ok_or_else(|| ScaleSetError::Template("template has no sku.name".into()))?
        .to_string();
    let location = scaleset
        .get("location")
        .and_then(Value::as_str)
        .ok_or_else(|| ScaleSetError::Template("template has no location".into()))?
        .to_string();

    wait_for_quota(
        client,
        &key.subscription,
        &location,
        &sku_name,
        delta,
        opts.spot,
        interrupt,
    )
    .await?;

    let target = current + delta;
    ensure_object_path(&mut scaleset, &["sku"])["capacity"] = json!(target);
    info!(scale_set = %key.scale_set, current, target, "Scaling scale set");
    client.put(&url, &scaleset).await?;

    Ok(target)
}

/// Delete the whole scale set.
pub async fn delete_scaleset(client: &AzureClient, key: &ScaleSetKey) -> ScaleSetResult<()> {
    let url = client.url(&format!(
        "{}?api-version={SCALESET_API_VERSION}",
        key.resource_path()
    ));
    info!(scale_set = %key.scale_set, "Deleting scale set");
    client.delete(&url).await?;
    Ok(())
}

/// Remove specific instances from the scale set.
pub async fn delete_instances(
    client: &AzureClient,
    key: &ScaleSetKey,
    instance_ids: &[&str],
) -> ScaleSetResult<()> {
    let url = client.url(&format!(
        "{}/delete?api-version={INSTANCE_API_VERSION}",
        key.resource_path()
    ));
    client.post(&url, &json!({ "instanceIds": instance_ids })).await?;
    Ok(())
}

/// Fetch one scale-set VM by instance id.
pub async fn get_instance(
    client: &AzureClient,
    key: &ScaleSetKey,
    instance_id: &str,
) -> ScaleSetResult<Value> {
    let url = client.url(&format!(
        "{}/virtualmachines/{instance_id}?api-version={INSTANCE_API_VERSION}",
        key.resource_path()
    ));
    Ok(client.get(&url).await?)
}

/// List the scale set's VMs (paged).
pub async fn list_instances(client: &AzureClient, key: &ScaleSetKey) -> ScaleSetResult<Vec<Value>> {
    let url = client.url(&format!(
        "{}/virtualMachines?api-version={SCALESET_API_VERSION}",
        key.resource_path()
    ));
    Ok(client.get_paged(&url).await?)
}

/// List the network interfaces attached across the scale set (paged).
pub async fn list_scaleset_nics(
    client: &AzureClient,
    key: &ScaleSetKey,
) -> ScaleSetResult<Vec<Value>> {
    let url = client.url(&format!(
        "{}/networkInterfaces?api-version={SCALESET_NIC_API_VERSION}",
        key.resource_path()
    ));
    Ok(client.get_paged(&url).await?)
}

/// Whether a VM named `vm_name` is still a member of the scale set.
pub async fn is_vm_in_scaleset(
    client: &AzureClient,
    key: &ScaleSetKey,
    vm_name: &str,
) -> ScaleSetResult<bool> {
    let instances = list_instances(client, key).await?;
    Ok(instances
        .iter()
        .any(|vm| vm.get("name").and_then(Value::as_str) == Some(vm_name)))
}
