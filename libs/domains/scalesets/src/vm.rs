//! Standalone VM and NIC lifecycle for detached-service hosts.

use crate::error::{ScaleSetError, ScaleSetResult};
use azure_rest::AzureClient;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

const VM_API_VERSION: &str = "2019-07-01";
const NIC_WRITE_API_VERSION: &str = "2019-11-01";
const NIC_READ_API_VERSION: &str = "2020-03-01";

/// How often provisioning and deletion state is re-read.
pub const VM_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Identity of a standalone VM.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VmKey {
    pub subscription: String,
    pub resource_group: String,
    pub name: String,
}

impl VmKey {
    pub fn new(
        subscription: impl Into<String>,
        resource_group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            resource_group: resource_group.into(),
            name: name.into(),
        }
    }

    fn resource_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
            self.subscription, self.resource_group, self.name
        )
    }

    fn nic_path(&self, nic_name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/networkInterfaces/{}",
            self.subscription, self.resource_group, nic_name
        )
    }
}

/// PUT a NIC from a template and return the response body (carries the id to
/// inject into the VM template).
pub async fn create_nic(
    client: &AzureClient,
    key: &VmKey,
    nic_name: &str,
    template: &Value,
) -> ScaleSetResult<Value> {
    let url = client.url(&format!(
        "{}?api-version={NIC_WRITE_API_VERSION}",
        key.nic_path(nic_name)
    ));
    Ok(client.put(&url, template).await?)
}

pub async fn get_nic(client: &AzureClient, key: &VmKey, nic_name: &str) -> ScaleSetResult<Value> {
    let url = client.url(&format!(
        "{}?api-version={NIC_READ_API_VERSION}",
        key.nic_path(nic_name)
    ));
    Ok(client.get(&url).await?)
}

pub async fn delete_nic(client: &AzureClient, key: &VmKey, nic_name: &str) -> ScaleSetResult<()> {
    let url = client.url(&format!(
        "{}?api-version={NIC_WRITE_API_VERSION}",
        key.nic_path(nic_name)
    ));
    client.delete(&url).await?;
    Ok(())
}

/// The private address of a NIC's first IP configuration.
pub fn nic_private_ip(nic: &Value) -> Option<&str> {
    nic.pointer("/properties/ipConfigurations/0/properties/privateIPAddress")
        .and_then(Value::as_str)
}

pub async fn create_vm(client: &AzureClient, key: &VmKey, template: &Value) -> ScaleSetResult<Value> {
    let url = client.url(&format!(
        "{}?api-version={VM_API_VERSION}",
        key.resource_path()
    ));
    info!(vm = %key.name, "Creating VM");
    Ok(client.put(&url, template).await?)
}

pub async fn get_vm(client: &AzureClient, key: &VmKey) -> ScaleSetResult<Value> {
    let url = client.url(&format!(
        "{}?api-version={VM_API_VERSION}",
        key.resource_path()
    ));
    Ok(client.get(&url).await?)
}

pub async fn delete_vm(client: &AzureClient, key: &VmKey) -> ScaleSetResult<()> {
    let url = client.url(&format!(
        "{}?api-version={VM_API_VERSION}",
        key.resource_path()
    ));
    info!(vm = %key.name, "Deleting VM");
    client.delete(&url).await?;
    Ok(())
}

/// List the resource group's VMs (paged).
pub async fn list_vms(
    client: &AzureClient,
    subscription: &str,
    resource_group: &str,
) -> ScaleSetResult<Vec<Value>> {
    let url = client.url(&format!(
        "/subscriptions/{subscription}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachines?api-version={VM_API_VERSION}"
    ));
    Ok(client.get_paged(&url).await?)
}

fn provisioning_state(vm: &Value) -> Option<&str> {
    vm.pointer("/properties/provisioningState").and_then(Value::as_str)
}

/// Poll until the VM reports `Succeeded`. `Failed` is fatal; exceeding
/// `timeout` is an error (the machine may still come up, but the caller's
/// worker-timeout budget is spent).
pub async fn wait_vm_provisioned(
    client: &AzureClient,
    key: &VmKey,
    timeout: Duration,
    poll_interval: Duration,
    interrupt: &mut watch::Receiver<bool>,
) -> ScaleSetResult<()> {
    let start = Instant::now();
    loop {
        if *interrupt.borrow() {
            return Err(ScaleSetError::Interrupted);
        }

        let vm = get_vm(client, key).await?;
        match provisioning_state(&vm) {
            Some("Succeeded") => {
                info!(vm = %key.name, "VM provisioned");
                return Ok(());
            }
            Some("Failed") => {
                return Err(ScaleSetError::ProvisioningFailed(key.name.clone()));
            }
            state => {
                tracing::debug!(vm = %key.name, ?state, "Waiting for VM provisioning");
            }
        }

        if start.elapsed() >= timeout {
            return Err(ScaleSetError::Timeout(format!(
                "provisioning of VM '{}'",
                key.name
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = interrupt.changed() => {}
        }
    }
}

/// Poll the VM list until `key.name` no longer appears. Overrunning `timeout`
/// logs a warning and returns normally; deletion continues server-side.
pub async fn wait_vm_deleted(
    client: &AzureClient,
    key: &VmKey,
    timeout: Duration,
    poll_interval: Duration,
) -> ScaleSetResult<()> {
    let start = Instant::now();
    loop {
        let vms = list_vms(client, &key.subscription, &key.resource_group).await?;
        let present = vms
            .iter()
            .any(|vm| vm.get("name").and_then(Value::as_str) == Some(key.name.as_str()));
        if !present {
            info!(vm = %key.name, "VM deleted");
            return Ok(());
        }

        if start.elapsed() >= timeout {
            warn!(
                vm = %key.name,
                "Timed out waiting for VM deletion; continuing, verify in the Azure portal"
            );
            return Ok(());
        }

        tokio::time::sleep(poll_interval).await;
    }
}
