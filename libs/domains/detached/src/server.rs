//! The detached-job HTTP service that runs on provisioned VMs.

use crate::error::{DetachedError, DetachedResult};
use crate::models::{DetachedVm, RunRequest, RunResponse};
use crate::registry::{strip_begin_end, Job, JobRegistry, JobState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use azure_rest::AzureClient;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use domain_scalesets::vm::delete_vm;
use domain_scalesets::VmKey;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// The interpreter jobs run under; swapped out in tests.
#[derive(Clone, Debug)]
pub struct JobRunner {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for JobRunner {
    fn default() -> Self {
        Self {
            program: "julia".to_string(),
            args: Vec::new(),
        }
    }
}

/// Shared state behind every route.
pub struct AppState {
    pub registry: JobRegistry,
    pub vm: DetachedVm,
    pub runner: JobRunner,
    /// Where code files and `job-<id>.out`/`.err` captures land.
    pub work_dir: PathBuf,
    /// Needed only for `persist=false` self-termination.
    pub arm_client: Option<AzureClient>,
    /// Last-posted variable bundle, process-wide.
    bundle: std::sync::RwLock<Option<Value>>,
}

impl AppState {
    pub fn new(vm: DetachedVm, runner: JobRunner, work_dir: PathBuf) -> Self {
        Self {
            registry: JobRegistry::new(),
            vm,
            runner,
            work_dir,
            arm_client: None,
            bundle: std::sync::RwLock::new(None),
        }
    }

    pub fn with_arm_client(mut self, client: AzureClient) -> Self {
        self.arm_client = Some(client);
        self
    }

    /// The last-posted variable bundle, if any.
    pub fn variable_bundle(&self) -> Option<Value> {
        self.bundle.read().expect("bundle lock poisoned").clone()
    }

    fn bundle_path(&self) -> PathBuf {
        self.work_dir.join("variable-bundle.json")
    }
}

/// All routes of the detached service, under `/cofii/detached`.
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/cofii/detached/run", post(run_job))
        .route("/cofii/detached/job/{id}/wait", post(wait_job))
        .route("/cofii/detached/job/{id}/status", get(job_status))
        .route("/cofii/detached/job/{id}/stdout", get(job_stdout))
        .route("/cofii/detached/job/{id}/stderr", get(job_stderr))
        .route("/cofii/detached/ping", get(ping))
        .route("/cofii/detached/vm", get(vm_identity))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Accept a job: write the (block-stripped) code to disk, record it, spawn
/// the runner, and — for `persist=false` — arm self-termination.
async fn run_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> DetachedResult<Json<RunResponse>> {
    let code = request
        .code
        .filter(|code| !code.trim().is_empty())
        .ok_or(DetachedError::MissingCode)?;
    let code = strip_begin_end(&code);

    if let Some(bundle) = &request.variablebundle {
        store_bundle(&state, bundle).await?;
    }

    tokio::fs::create_dir_all(&state.work_dir).await?;
    let id = state.registry.allocate_id();
    let code_path = state.work_dir.join(format!("job-{id}.code"));
    tokio::fs::write(&code_path, &code).await?;

    let stdout_path = state.work_dir.join(format!("job-{id}.out"));
    let stderr_path = state.work_dir.join(format!("job-{id}.err"));
    let (job, state_tx) =
        state
            .registry
            .insert(id, code, code_path, stdout_path, stderr_path);

    info!(job = id, persist = request.persist, "Accepted detached job");
    tokio::spawn(drive_job(state.clone(), job.clone(), state_tx));
    if !request.persist {
        tokio::spawn(self_terminate(state.clone(), job));
    }

    Ok(Json(RunResponse { id }))
}

/// Decode the base64 JSON object and persist it where jobs can read it
/// (exported as `AZ_VARIABLE_BUNDLE`).
async fn store_bundle(state: &Arc<AppState>, encoded: &str) -> DetachedResult<()> {
    let decoded = BASE64
        .decode(encoded)
        .map_err(|e| DetachedError::InvalidBundle(e.to_string()))?;
    let bundle: Value = serde_json::from_slice(&decoded)
        .map_err(|e| DetachedError::InvalidBundle(e.to_string()))?;
    if !bundle.is_object() {
        return Err(DetachedError::InvalidBundle(
            "bundle is not a JSON object".to_string(),
        ));
    }

    tokio::fs::create_dir_all(&state.work_dir).await?;
    tokio::fs::write(state.bundle_path(), serde_json::to_vec(&bundle)?).await?;
    *state.bundle.write().expect("bundle lock poisoned") = Some(bundle);
    Ok(())
}

/// Run the job to completion and report the terminal state.
async fn drive_job(state: Arc<AppState>, job: Arc<Job>, state_tx: watch::Sender<JobState>) {
    let _ = state_tx.send(JobState::Running);

    match execute(&state, &job).await {
        Ok(()) => {
            info!(job = job.id, "Job done");
            let _ = state_tx.send(JobState::Done);
        }
        Err(message) => {
            warn!(job = job.id, error = %message, "Job failed");
            // Append the error and the numbered listing to the stderr capture.
            let appendix = format!("\n{message}\n{}\n", job.numbered_listing());
            let mut stderr = tokio::fs::read_to_string(&job.stderr_path)
                .await
                .unwrap_or_default();
            stderr.push_str(&appendix);
            if let Err(e) = tokio::fs::write(&job.stderr_path, stderr).await {
                error!(job = job.id, error = %e, "Could not record job failure");
            }
            let _ = state_tx.send(JobState::Failed(message));
        }
    }
}

/// Spawn the interpreter on the code file with stdout/stderr redirected to
/// the capture files.
async fn execute(state: &AppState, job: &Job) -> Result<(), String> {
    let stdout = std::fs::File::create(&job.stdout_path)
        .map_err(|e| format!("cannot create stdout capture: {e}"))?;
    let stderr = std::fs::File::create(&job.stderr_path)
        .map_err(|e| format!("cannot create stderr capture: {e}"))?;

    let mut command = tokio::process::Command::new(&state.runner.program);
    command
        .args(&state.runner.args)
        .arg(&job.code_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    if state.bundle_path().exists() {
        command.env("AZ_VARIABLE_BUNDLE", state.bundle_path());
    }

    let status = command
        .status()
        .await
        .map_err(|e| format!("cannot start {}: {e}", state.runner.program))?;

    if status.success() {
        Ok(())
    } else {
        Err(format!("process exited with {status}"))
    }
}

/// `persist=false`: once the job reaches a terminal state, delete the VM we
/// are running on.
async fn self_terminate(state: Arc<AppState>, job: Arc<Job>) {
    job.wait().await;
    info!(job = job.id, vm = %state.vm.name, "Job finished with persist=false, deleting this VM");

    match &state.arm_client {
        Some(client) => {
            let key = VmKey::new(
                &state.vm.subscriptionid,
                &state.vm.resourcegroup,
                &state.vm.name,
            );
            if let Err(e) = delete_vm(client, &key).await {
                error!(error = %e, vm = %state.vm.name, "Self-termination failed; delete the VM manually");
            }
        }
        None => {
            warn!(vm = %state.vm.name, "No ARM client configured; skipping self-termination");
        }
    }
}

async fn wait_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> DetachedResult<Json<Value>> {
    let job = state
        .registry
        .get(&id)
        .ok_or_else(|| DetachedError::UnknownJob(id.clone()))?;

    match job.wait().await {
        JobState::Failed(error) => Err(DetachedError::JobFailed {
            error,
            listing: job.numbered_listing(),
        }),
        _ => Ok(Json(json!({"status": "done"}))),
    }
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> DetachedResult<Json<Value>> {
    let job = state
        .registry
        .get(&id)
        .ok_or_else(|| DetachedError::UnknownJob(id.clone()))?;
    Ok(Json(json!({"status": job.state().as_str()})))
}

async fn job_stdout(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> DetachedResult<String> {
    read_capture(&state, &id, |job| job.stdout_path.clone()).await
}

async fn job_stderr(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> DetachedResult<String> {
    read_capture(&state, &id, |job| job.stderr_path.clone()).await
}

async fn read_capture(
    state: &AppState,
    id: &str,
    path_of: impl Fn(&Job) -> PathBuf,
) -> DetachedResult<String> {
    let job = state
        .registry
        .get(id)
        .ok_or_else(|| DetachedError::UnknownJob(id.to_string()))?;
    Ok(tokio::fs::read_to_string(path_of(&job))
        .await
        .unwrap_or_default())
}

async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn vm_identity(State(state): State<Arc<AppState>>) -> Json<DetachedVm> {
    Json(state.vm.clone())
}
