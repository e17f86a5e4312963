//! Detached jobs: run code on a persistent VM over HTTP.
//!
//! The server side runs on the provisioned VM (see `apps/detached-server`)
//! and executes submitted code under redirected I/O; the client side
//! provisions such VMs, submits jobs and retrieves their results.

pub mod client;
pub mod error;
pub mod models;
pub mod registry;
pub mod server;

pub use client::{addproc, detach, detach_at, rmproc, AddProcOptions, DetachedClient};
pub use error::{DetachedError, DetachedResult};
pub use models::{DetachedJob, DetachedVm, OutputStream, RunRequest, RunResponse};
pub use registry::{Job, JobRegistry, JobState};
pub use server::{router, AppState, JobRunner};
