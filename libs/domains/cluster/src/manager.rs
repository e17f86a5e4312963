//! The manager singleton: listener, acceptor/registrar tasks, scale-set
//! reference counting and the worker kill protocol.

use crate::error::{ManagerError, ManagerResult};
use crate::worker::{read_handshake, WorkerConfig, WorkerUserData};
use async_trait::async_trait;
use azure_rest::AzureClient;
use domain_scalesets::scaleset::{
    delete_instances, delete_scaleset, get_instance, is_vm_in_scaleset, scaleset_create_or_update,
    ScaleSetKey, ScaleSetOptions,
};
use domain_scalesets::ScaleSetError;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// First port probed for the master's listening socket.
const LISTEN_PORT_BASE: u16 = 9000;

/// Accepted-but-unregistered sockets; a full queue blocks the acceptor and
/// backpressures a handshake storm.
const PENDING_UP_CAPACITY: usize = 32;

/// Seam to the distributed-compute runtime. The manager accepts and
/// validates sockets; the runtime owns everything after registration.
#[async_trait]
pub trait WorkerRuntime: Send + Sync + 'static {
    /// Take ownership of a handshaken worker socket.
    async fn register(&self, stream: TcpStream, config: WorkerConfig) -> ManagerResult<()>;

    /// Ask the worker process to exit (the runtime's remote-call channel).
    async fn request_exit(&self, config: &WorkerConfig);
}

/// Tunables beyond the Azure client itself.
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Shared secret workers must present.
    pub cookie: String,
    pub exename: String,
    pub exeflags: String,
    /// Pause between kill-verification polls (60-70 s in production).
    pub kill_poll_interval: Duration,
    /// Upper bound of the random pre-kill smoothing sleep.
    pub kill_smoothing_max: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            cookie: String::new(),
            exename: "julia".to_string(),
            exeflags: "--worker".to_string(),
            kill_poll_interval: Duration::from_secs(60),
            kill_smoothing_max: Duration::from_secs(10),
        }
    }
}

struct ManagerInner {
    client: std::sync::RwLock<AzureClient>,
    opts: ManagerOptions,
    listen_addr: SocketAddr,
    runtime: Arc<dyn WorkerRuntime>,
    scaleset_counts: Mutex<HashMap<ScaleSetKey, usize>>,
    pending_down: Mutex<JoinSet<()>>,
}

impl ManagerInner {
    fn client(&self) -> AzureClient {
        self.client.read().expect("client lock poisoned").clone()
    }

    async fn count_of(&self, key: &ScaleSetKey) -> usize {
        *self.scaleset_counts.lock().await.get(key).unwrap_or(&0)
    }
}

/// Cheaply cloneable handle on the process-wide manager state.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<ManagerInner>,
}

static GLOBAL: tokio::sync::OnceCell<ClusterManager> = tokio::sync::OnceCell::const_new();

impl ClusterManager {
    /// Bind the listening socket and spawn the acceptor and registrar tasks.
    pub async fn start(
        client: AzureClient,
        runtime: Arc<dyn WorkerRuntime>,
        opts: ManagerOptions,
    ) -> ManagerResult<Self> {
        let listener = bind_from(LISTEN_PORT_BASE).await?;
        let listen_addr = listener.local_addr()?;
        info!(%listen_addr, "Cluster manager listening for workers");

        let inner = Arc::new(ManagerInner {
            client: std::sync::RwLock::new(client),
            opts,
            listen_addr,
            runtime,
            scaleset_counts: Mutex::new(HashMap::new()),
            pending_down: Mutex::new(JoinSet::new()),
        });

        let (pending_up_tx, pending_up_rx) = mpsc::channel(PENDING_UP_CAPACITY);
        tokio::spawn(acceptor(listener, pending_up_tx));
        tokio::spawn(registrar(inner.clone(), pending_up_rx));

        Ok(Self { inner })
    }

    /// The process-wide manager. The first call initializes it; later calls
    /// only swap in the (possibly re-authenticated, re-tuned) client.
    pub async fn global(
        client: AzureClient,
        runtime: Arc<dyn WorkerRuntime>,
        opts: ManagerOptions,
    ) -> ManagerResult<&'static ClusterManager> {
        let manager = GLOBAL
            .get_or_try_init(|| Self::start(client.clone(), runtime, opts))
            .await?;
        manager.reconfigure(client);
        Ok(manager)
    }

    /// Swap the Azure client (session, retry budget, verbosity).
    pub fn reconfigure(&self, client: AzureClient) {
        *self.inner.client.write().expect("client lock poisoned") = client;
    }

    pub fn listen_addr(&self) -> IpAddr {
        self.inner.listen_addr.ip()
    }

    pub fn listen_port(&self) -> u16 {
        self.inner.listen_addr.port()
    }

    /// Workers currently attributed to this master (sum over scale sets).
    pub async fn worker_count(&self) -> usize {
        self.inner.scaleset_counts.lock().await.values().sum()
    }

    pub async fn scaleset_count(&self, key: &ScaleSetKey) -> usize {
        self.inner.count_of(key).await
    }

    /// Grow `key` by `ninstances` instances of `ppi` worker processes each
    /// and account for the workers that will dial back.
    pub async fn add_workers(
        &self,
        key: &ScaleSetKey,
        ninstances: i64,
        ppi: usize,
        template: &Value,
        opts: &ScaleSetOptions,
        interrupt: &mut watch::Receiver<bool>,
    ) -> ManagerResult<i64> {
        let client = self.inner.client();
        let total =
            scaleset_create_or_update(&client, key, ninstances, template, opts, interrupt).await?;

        let mut counts = self.inner.scaleset_counts.lock().await;
        *counts.entry(key.clone()).or_insert(0) += ninstances as usize * ppi;
        Ok(total)
    }

    /// One worker process left (deregister or interrupt). Dropping the last
    /// reference deletes the whole scale set.
    pub async fn deregister(&self, userdata: &WorkerUserData) -> ManagerResult<()> {
        let key = scaleset_key(userdata);

        let delete = {
            let mut counts = self.inner.scaleset_counts.lock().await;
            match counts.get_mut(&key) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if *count == 0 {
                        counts.remove(&key);
                        true
                    } else {
                        false
                    }
                }
                _ => {
                    warn!(scale_set = %key.scale_set, "Deregister for untracked scale set");
                    false
                }
            }
        };

        if delete {
            delete_scaleset(&self.inner.client(), &key).await?;
        }
        Ok(())
    }

    /// Remove one worker: exit RPC, then (for primaries) delete its instance
    /// and verify the deletion in a background task.
    ///
    /// Never blocks the master on Azure; the verification task lands in
    /// `pending_down` and is awaited by [`ClusterManager::shutdown`].
    pub async fn kill(&self, config: WorkerConfig) {
        self.inner.runtime.request_exit(&config).await;

        // Secondary processes share their primary's VM.
        let Some(userdata) = config.userdata else {
            return;
        };

        let inner = self.inner.clone();
        let task = async move {
            kill_instance(inner, userdata).await;
        };
        self.inner.pending_down.lock().await.spawn(task);
    }

    /// Await every in-flight kill task; call before process exit.
    pub async fn shutdown(&self) {
        let mut pending = self.inner.pending_down.lock().await;
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Worker removal task panicked");
            }
        }
        debug!("All pending worker removals drained");
    }
}

fn scaleset_key(userdata: &WorkerUserData) -> ScaleSetKey {
    ScaleSetKey::new(
        &userdata.subscriptionid,
        &userdata.resourcegroup,
        &userdata.scalesetname,
    )
}

/// Bind the first free port at or above `base`.
async fn bind_from(base: u16) -> ManagerResult<TcpListener> {
    let host = Ipv4Addr::UNSPECIFIED;
    for port in base..base + 1000 {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(ManagerError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("no free port in {base}..{}", base + 1000),
    )))
}

/// Accept connections forever and queue them for registration. A send on the
/// bounded channel blocks when the registrar falls behind.
async fn acceptor(listener: TcpListener, pending_up: mpsc::Sender<TcpStream>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Accepted worker connection");
                if pending_up.send(stream).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept worker connection");
            }
        }
    }
}

/// Sole consumer of `pending_up`: handshake each socket and hand it to the
/// distributed runtime. Handshake failures close the socket and register
/// nothing.
async fn registrar(inner: Arc<ManagerInner>, mut pending_up: mpsc::Receiver<TcpStream>) {
    while let Some(mut stream) = pending_up.recv().await {
        match read_handshake(&mut stream, &inner.opts.cookie).await {
            Ok(hello) => {
                let config = WorkerConfig {
                    bind_addr: hello.bind_addr,
                    count: hello.ppi,
                    exename: inner.opts.exename.clone(),
                    exeflags: inner.opts.exeflags.clone(),
                    userdata: hello.userdata,
                };
                if let Err(e) = inner.runtime.register(stream, config).await {
                    warn!(error = %e, "Distributed runtime rejected worker");
                }
            }
            Err(e) => {
                warn!(error = %e, "Worker handshake failed, closing connection");
            }
        }
    }
}

/// The kill protocol for one instance, run inside `pending_down`.
async fn kill_instance(inner: Arc<ManagerInner>, userdata: WorkerUserData) {
    // Smooth bursts of kills over the Azure API rate limits.
    let smoothing = Duration::from_secs(1)
        + inner.opts.kill_smoothing_max.mul_f64(rand::rng().random::<f64>());
    tokio::time::sleep(smoothing).await;

    let key = scaleset_key(&userdata);
    let client = inner.client();

    // Refcount already zero: the whole scale set is being torn down.
    if inner.count_of(&key).await == 0 {
        debug!(scale_set = %key.scale_set, "Scale set teardown in flight, skipping instance delete");
        return;
    }

    match is_vm_in_scaleset(&client, &key, &userdata.name).await {
        Ok(true) => {}
        Ok(false) => {
            info!(vm = %userdata.name, "VM already absent from scale set, marking worker terminated");
            return;
        }
        Err(e) => {
            warn!(error = %e, vm = %userdata.name, "Could not verify scale-set membership");
            return;
        }
    }

    if let Err(e) = delete_instances(&client, &key, &[userdata.instanceid.as_str()]).await {
        warn!(error = %e, vm = %userdata.name, "Instance delete failed; manual cleanup may be required");
        return;
    }

    // Verify: only a 404 proves the instance is gone. `Deleting` (and
    // `Succeeded`, while the delete is still propagating) keep polling.
    loop {
        match get_instance(&client, &key, &userdata.instanceid)
            .await
            .map_err(ManagerErrorSource::from)
        {
            Err(ManagerErrorSource::NotFound) => {
                info!(vm = %userdata.name, "Instance deletion verified");
                return;
            }
            Err(ManagerErrorSource::Other(e)) => {
                warn!(error = %e, vm = %userdata.name, "Instance poll failed; manual cleanup may be required");
                return;
            }
            Ok(vm) => {
                let state = vm
                    .pointer("/properties/provisioningState")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match state {
                    "Succeeded" | "Deleting" => {
                        debug!(vm = %userdata.name, state, "Waiting for instance deletion");
                    }
                    other => {
                        warn!(
                            vm = %userdata.name,
                            state = other,
                            "Unexpected provisioning state during delete; manual cleanup may be required"
                        );
                        return;
                    }
                }
            }
        }

        let pause = inner.opts.kill_poll_interval
            + inner.opts.kill_poll_interval.mul_f64(rand::rng().random::<f64>() / 6.0);
        tokio::time::sleep(pause).await;
    }
}

/// Split a scale-set error into "instance is gone" vs everything else.
enum ManagerErrorSource {
    NotFound,
    Other(ScaleSetError),
}

impl From<ScaleSetError> for ManagerErrorSource {
    fn from(e: ScaleSetError) -> Self {
        match &e {
            ScaleSetError::Rest(rest) if rest.is_not_found() => ManagerErrorSource::NotFound,
            _ => ManagerErrorSource::Other(e),
        }
    }
}
