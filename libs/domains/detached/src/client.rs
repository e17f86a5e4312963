//! Client side of detached jobs: VM provisioning, job submission and result
//! retrieval.

use crate::error::{DetachedError, DetachedResult};
use crate::models::{DetachedJob, DetachedVm, OutputStream, RunRequest, RunResponse};
use azure_rest::{AzureClient, InstanceMetadata};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use core_config::server::DETACHED_SERVICE_PORT;
use domain_scalesets::cloudinit::encode_custom_data;
use domain_scalesets::image::{resolve_image, ImageSpec};
use domain_scalesets::quota::wait_for_quota;
use domain_scalesets::templates::{add_public_key, ensure_object_path, TemplateKind};
use domain_scalesets::vm::{
    create_nic, create_vm, delete_nic, delete_vm, get_nic, nic_private_ip, wait_vm_deleted,
    wait_vm_provisioned,
};
use domain_scalesets::{ScaleSetError, VmKey};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// HTTP client for a detached service, addressable by VM IP.
pub struct DetachedClient {
    http: reqwest::Client,
    port: u16,
}

impl Default for DetachedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DetachedClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            port: DETACHED_SERVICE_PORT,
        }
    }

    /// Target a non-default service port (tests, tunnels).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn base(&self, ip: &str) -> String {
        format!("http://{ip}:{}/cofii/detached", self.port)
    }

    /// One liveness probe.
    pub async fn ping(&self, ip: &str) -> bool {
        let url = format!("{}/ping", self.base(ip));
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Poll `/ping` every `interval` until the service answers, bounded by
    /// `timeout`. Shows a spinner while waiting.
    pub async fn wait_ready(
        &self,
        ip: &str,
        timeout: Duration,
        interval: Duration,
    ) -> DetachedResult<()> {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}").expect("static template is valid"),
        );
        spinner.set_message(format!("waiting for detached service on {ip}"));
        spinner.enable_steady_tick(Duration::from_millis(120));

        let start = Instant::now();
        loop {
            if self.ping(ip).await {
                spinner.finish_and_clear();
                info!(ip, "Detached service is ready");
                return Ok(());
            }
            if start.elapsed() >= timeout {
                spinner.finish_and_clear();
                return Err(DetachedError::ServiceUnready(ip.to_string()));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Recover the full VM identity from an IP.
    pub async fn vm_identity(&self, ip: &str) -> DetachedResult<DetachedVm> {
        let url = format!("{}/vm", self.base(ip));
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DetachedError::UnexpectedResponse {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    /// Submit code to a known VM and return the job handle.
    pub async fn run(
        &self,
        vm: &DetachedVm,
        code: &str,
        persist: bool,
        variablebundle: Option<&Value>,
    ) -> DetachedResult<DetachedJob> {
        let request = RunRequest {
            code: Some(code.to_string()),
            persist,
            variablebundle: variablebundle
                .map(|bundle| BASE64.encode(serde_json::to_vec(bundle).unwrap_or_default())),
        };

        let url = format!("{}/run", self.base(&vm.ip));
        let response = self.http.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(DetachedError::UnexpectedResponse {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let accepted: RunResponse = response.json().await?;

        let id = accepted.id.to_string();
        let log_url = format!("{}/job/{id}/stdout", self.base(&vm.ip));
        info!(vm = %vm.name, job = %id, "Submitted detached job");
        Ok(DetachedJob {
            vm: vm.clone(),
            id,
            log_url,
        })
    }

    pub async fn status(&self, job: &DetachedJob) -> DetachedResult<String> {
        let url = format!("{}/job/{}/status", self.base(&job.vm.ip), job.id);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DetachedError::UnexpectedResponse {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body: Value = response.json().await?;
        Ok(body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    /// Block until the job finishes; a failed job surfaces the server-side
    /// error and the numbered code listing.
    pub async fn wait(&self, job: &DetachedJob) -> DetachedResult<()> {
        let url = format!("{}/job/{}/wait", self.base(&job.vm.ip), job.id);
        let response = self.http.post(&url).send().await?;
        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
            if parsed.get("error").is_some() {
                return Err(DetachedError::JobFailed {
                    error: parsed
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("job failed")
                        .to_string(),
                    listing: parsed
                        .get("code")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        Err(DetachedError::UnexpectedResponse { status, body })
    }

    /// Fetch the captured stdout or stderr.
    pub async fn read(&self, job: &DetachedJob, stream: OutputStream) -> DetachedResult<String> {
        let url = format!(
            "{}/job/{}/{}",
            self.base(&job.vm.ip),
            job.id,
            stream.as_str()
        );
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DetachedError::UnexpectedResponse {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.text().await?)
    }
}

/// Provisioning knobs for one standalone VM.
#[derive(Clone, Debug)]
pub struct AddProcOptions {
    /// Unix user receiving the master's public key.
    pub user: String,
    pub public_key: String,
    pub image: ImageSpec,
    /// Rendered first-boot script (detached variant when `detached_service`).
    pub startup_script: String,
    /// Whether the VM hosts the detached HTTP service (gates readiness
    /// polling).
    pub detached_service: bool,
    /// Overall budget for provisioning and readiness (the distributed
    /// runtime's worker timeout).
    pub timeout: Duration,
    pub provision_poll_interval: Duration,
    pub ping_interval: Duration,
    /// Service port polled for readiness.
    pub service_port: u16,
}

impl Default for AddProcOptions {
    fn default() -> Self {
        Self {
            user: String::new(),
            public_key: String::new(),
            image: ImageSpec::default(),
            startup_script: String::new(),
            detached_service: true,
            timeout: Duration::from_secs(15 * 60),
            provision_poll_interval: Duration::from_secs(10),
            ping_interval: Duration::from_secs(5),
            service_port: DETACHED_SERVICE_PORT,
        }
    }
}

fn nic_name(key: &VmKey) -> String {
    format!("{}-nic", key.name)
}

/// Provision one standalone VM: NIC, image, SSH key, cloud-init, quota gate,
/// VM PUT, provisioning poll, private-IP lookup and (for service VMs) the
/// readiness poll.
pub async fn addproc(
    client: &AzureClient,
    key: &VmKey,
    vm_template: &Value,
    nic_template: &Value,
    opts: &AddProcOptions,
    imds: &InstanceMetadata,
    interrupt: &mut watch::Receiver<bool>,
) -> DetachedResult<DetachedVm> {
    let mut template = vm_template.clone();
    resolve_image(&mut template, TemplateKind::Vm, &opts.image, imds).await?;

    let nic_name = nic_name(key);
    let nic = create_nic(client, key, &nic_name, nic_template).await?;
    let nic_id = nic
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ScaleSetError::Template("NIC response has no id".into()))?;
    ensure_object_path(&mut template, &["properties", "networkProfile"])["networkInterfaces"] =
        json!([{ "id": nic_id }]);

    add_public_key(&mut template, TemplateKind::Vm, &opts.user, &opts.public_key);
    ensure_object_path(&mut template, &["properties", "osProfile"])["customData"] =
        Value::String(encode_custom_data(&opts.startup_script));

    let sku_name = template
        .pointer("/properties/hardwareProfile/vmSize")
        .and_then(Value::as_str)
        .ok_or_else(|| ScaleSetError::Template("template has no hardwareProfile.vmSize".into()))?
        .to_string();
    let location = template
        .get("location")
        .and_then(Value::as_str)
        .ok_or_else(|| ScaleSetError::Template("template has no location".into()))?
        .to_string();
    wait_for_quota(
        client,
        &key.subscription,
        &location,
        &sku_name,
        1,
        false,
        interrupt,
    )
    .await?;

    create_vm(client, key, &template).await?;
    wait_vm_provisioned(
        client,
        key,
        opts.timeout,
        opts.provision_poll_interval,
        interrupt,
    )
    .await?;

    let nic = get_nic(client, key, &nic_name).await?;
    let ip = nic_private_ip(&nic)
        .ok_or_else(|| ScaleSetError::Template("NIC has no private IP".into()))?
        .to_string();

    let vm = DetachedVm {
        name: key.name.clone(),
        ip,
        subscriptionid: key.subscription.clone(),
        resourcegroup: key.resource_group.clone(),
    };

    if opts.detached_service {
        DetachedClient::new()
            .with_port(opts.service_port)
            .wait_ready(&vm.ip, opts.timeout, opts.ping_interval)
            .await?;
    }

    info!(vm = %vm.name, ip = %vm.ip, "VM provisioned");
    Ok(vm)
}

/// Tear a standalone VM down: delete the VM, wait for the name to leave the
/// listing (warn on overrun), then delete its NIC.
pub async fn rmproc(
    client: &AzureClient,
    key: &VmKey,
    timeout: Duration,
    poll_interval: Duration,
) -> DetachedResult<()> {
    delete_vm(client, key).await?;
    wait_vm_deleted(client, key, timeout, poll_interval).await?;

    if let Err(e) = delete_nic(client, key, &nic_name(key)).await {
        warn!(error = %e, vm = %key.name, "NIC delete failed; clean up manually");
    }
    Ok(())
}

/// Provision a VM (detached variant) and immediately submit `code` to it.
#[allow(clippy::too_many_arguments)]
pub async fn detach(
    client: &AzureClient,
    key: &VmKey,
    vm_template: &Value,
    nic_template: &Value,
    opts: &AddProcOptions,
    imds: &InstanceMetadata,
    interrupt: &mut watch::Receiver<bool>,
    code: &str,
    persist: bool,
    variablebundle: Option<&Value>,
) -> DetachedResult<DetachedJob> {
    let vm = addproc(client, key, vm_template, nic_template, opts, imds, interrupt).await?;
    DetachedClient::new()
        .with_port(opts.service_port)
        .run(&vm, code, persist, variablebundle)
        .await
}

/// Submit `code` to an already-running detached service by IP.
pub async fn detach_at(
    ip: &str,
    port: u16,
    code: &str,
    persist: bool,
    variablebundle: Option<&Value>,
) -> DetachedResult<DetachedJob> {
    let client = DetachedClient::new().with_port(port);
    let vm = client.vm_identity(ip).await?;
    client.run(&vm, code, persist, variablebundle).await
}
