//! addproc/rmproc against stubbed ARM endpoints.

use azure_rest::{AzureClient, InstanceMetadata, RetryPolicy, StaticTokenSession};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use domain_detached::{addproc, rmproc, AddProcOptions};
use domain_scalesets::image::ImageSpec;
use domain_scalesets::VmKey;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const VM_PATH: &str =
    "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm0";
const NIC_PATH: &str =
    "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/networkInterfaces/vm0-nic";

fn client_for(server: &MockServer) -> AzureClient {
    AzureClient::new(Arc::new(StaticTokenSession::new("t")), RetryPolicy::new(0))
        .unwrap()
        .with_endpoint(server.uri())
}

fn vm_template() -> Value {
    json!({
        "location": "eastus",
        "properties": {
            "hardwareProfile": {"vmSize": "Standard_D2s_v3"},
            "storageProfile": {"imageReference": {
                "id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/galleries/g/images/base"
            }},
            "osProfile": {"adminUsername": "cvx"}
        }
    })
}

fn options() -> AddProcOptions {
    AddProcOptions {
        user: "cvx".to_string(),
        public_key: "ssh-rsa AAAA".to_string(),
        image: ImageSpec {
            sig_image_name: Some("base".to_string()),
            ..Default::default()
        },
        startup_script: "#!/bin/sh\necho detached\n".to_string(),
        detached_service: false, // readiness polling covered in end_to_end.rs
        timeout: Duration::from_secs(5),
        provision_poll_interval: Duration::from_millis(10),
        ping_interval: Duration::from_millis(10),
        ..AddProcOptions::default()
    }
}

async fn mount_provisioning_stubs(server: &MockServer) {
    mount_provisioning_stubs_with_ip(server, "10.0.0.42").await;
}

async fn mount_provisioning_stubs_with_ip(server: &MockServer, ip: &str) {
    Mock::given(method("PUT"))
        .and(path(NIC_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "nic-arm-id"})))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/subscriptions/sub/providers/Microsoft.Compute/skus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"name": "Standard_D2s_v3", "family": "standardDSv3Family",
                       "capabilities": [{"name": "vCPUs", "value": "2"}]}]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(
            "/subscriptions/sub/providers/Microsoft.Compute/locations/eastus/usages",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {"name": {"value": "standardDSv3Family"}, "limit": 10, "currentValue": 0},
                {"name": {"value": "lowPriorityCores"}, "limit": 10, "currentValue": 0}
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path(VM_PATH))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"name": "vm0"})))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(VM_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "properties": {"provisioningState": "Succeeded"}
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(NIC_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "properties": {"ipConfigurations": [
                {"properties": {"privateIPAddress": ip}}
            ]}
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn addproc_provisions_nic_then_vm_and_returns_identity() {
    let server = MockServer::start().await;
    mount_provisioning_stubs(&server).await;

    let client = client_for(&server);
    let key = VmKey::new("sub", "rg", "vm0");
    let imds = InstanceMetadata::new().unwrap(); // not contacted: image is explicit
    let (_tx, mut rx) = watch::channel(false);

    let vm = addproc(
        &client,
        &key,
        &vm_template(),
        &json!({"location": "eastus"}),
        &options(),
        &imds,
        &mut rx,
    )
    .await
    .unwrap();

    assert_eq!(vm.name, "vm0");
    assert_eq!(vm.ip, "10.0.0.42");
    assert_eq!(vm.subscriptionid, "sub");
    assert_eq!(vm.resourcegroup, "rg");

    // Inspect the VM PUT body.
    let requests = server.received_requests().await.unwrap();
    let vm_put: Value = requests
        .iter()
        .find(|r| r.method.as_str() == "PUT" && r.url.path() == VM_PATH)
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .unwrap();

    // The created NIC's ARM id is wired into the template.
    assert_eq!(
        vm_put.pointer("/properties/networkProfile/networkInterfaces/0/id"),
        Some(&json!("nic-arm-id"))
    );
    // Master key + startup script landed in osProfile.
    assert_eq!(
        vm_put
            .pointer("/properties/osProfile/linuxConfiguration/ssh/publicKeys/0/keyData")
            .unwrap(),
        "ssh-rsa AAAA"
    );
    let custom_data = vm_put
        .pointer("/properties/osProfile/customData")
        .unwrap()
        .as_str()
        .unwrap();
    assert_eq!(
        BASE64.decode(custom_data).unwrap(),
        b"#!/bin/sh\necho detached\n"
    );
}

#[tokio::test]
async fn addproc_fails_when_provisioning_fails() {
    let server = MockServer::start().await;
    mount_provisioning_stubs(&server).await;
    // Override the VM GET with a failed provisioning state.
    server.reset().await;
    mount_failed_stubs(&server).await;

    let client = client_for(&server);
    let key = VmKey::new("sub", "rg", "vm0");
    let imds = InstanceMetadata::new().unwrap();
    let (_tx, mut rx) = watch::channel(false);

    let err = addproc(
        &client,
        &key,
        &vm_template(),
        &json!({"location": "eastus"}),
        &options(),
        &imds,
        &mut rx,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("check the Azure portal"));
}

async fn mount_failed_stubs(server: &MockServer) {
    Mock::given(method("PUT"))
        .and(path(NIC_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "nic-arm-id"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/subscriptions/sub/providers/Microsoft.Compute/skus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"name": "Standard_D2s_v3", "family": "standardDSv3Family",
                       "capabilities": [{"name": "vCPUs", "value": "2"}]}]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(
            "/subscriptions/sub/providers/Microsoft.Compute/locations/eastus/usages",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"name": {"value": "standardDSv3Family"}, "limit": 10, "currentValue": 0},
                      {"name": {"value": "lowPriorityCores"}, "limit": 10, "currentValue": 0}]
        })))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path(VM_PATH))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"name": "vm0"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(VM_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "properties": {"provisioningState": "Failed"}
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn detach_provisions_a_service_vm_and_submits_the_job() {
    use domain_detached::{detach, DetachedClient, DetachedVm, JobRunner, OutputStream};
    use tempfile::TempDir;

    // A live detached service stands in for the freshly booted VM.
    let dir = TempDir::new().unwrap();
    let state = domain_detached::AppState::new(
        DetachedVm {
            name: "vm0".to_string(),
            ip: "127.0.0.1".to_string(),
            subscriptionid: "sub".to_string(),
            resourcegroup: "rg".to_string(),
        },
        JobRunner {
            program: "sh".to_string(),
            args: vec![],
        },
        dir.path().to_path_buf(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let service_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, domain_detached::router(state)).await.unwrap();
    });

    let server = MockServer::start().await;
    mount_provisioning_stubs_with_ip(&server, "127.0.0.1").await;

    let client = client_for(&server);
    let key = VmKey::new("sub", "rg", "vm0");
    let imds = InstanceMetadata::new().unwrap();
    let (_tx, mut rx) = watch::channel(false);

    let mut opts = options();
    opts.detached_service = true;
    opts.service_port = service_port;
    opts.ping_interval = Duration::from_millis(20);

    let job = detach(
        &client,
        &key,
        &vm_template(),
        &json!({"location": "eastus"}),
        &opts,
        &imds,
        &mut rx,
        "printf 'job3-out'",
        true,
        None,
    )
    .await
    .unwrap();

    let detached = DetachedClient::new().with_port(service_port);
    detached.wait(&job).await.unwrap();
    assert_eq!(
        detached.read(&job, OutputStream::Stdout).await.unwrap(),
        "job3-out"
    );
}

#[tokio::test]
async fn rmproc_deletes_vm_then_nic() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(VM_PATH))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(NIC_PATH))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let key = VmKey::new("sub", "rg", "vm0");
    rmproc(
        &client,
        &key,
        Duration::from_secs(2),
        Duration::from_millis(10),
    )
    .await
    .unwrap();
}
