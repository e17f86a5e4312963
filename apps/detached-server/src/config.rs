//! Configuration for the detached-job service

use core_config::server::ServerConfig;
use core_config::{env_or_default, ConfigError, FromEnv};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address of the HTTP service.
    pub server: ServerConfig,
    /// Where code files and capture files land.
    pub work_dir: PathBuf,
    /// Interpreter jobs run under.
    pub runner_program: String,
    /// Bearer token for self-termination; without one, `persist=false`
    /// cannot delete the hosting VM.
    pub arm_token: Option<String>,
}

impl FromEnv for Config {
    /// Reads from environment variables with sensible defaults:
    /// - HOST / PORT: bind address (defaults 0.0.0.0:8081)
    /// - DETACHED_WORK_DIR: capture directory (default "detached-jobs")
    /// - DETACHED_RUNNER: interpreter (default "julia")
    /// - AZURE_TOKEN: ARM bearer token, optional
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_env()?,
            work_dir: PathBuf::from(env_or_default("DETACHED_WORK_DIR", "detached-jobs")),
            runner_program: env_or_default("DETACHED_RUNNER", "julia"),
            arm_token: std::env::var("AZURE_TOKEN").ok(),
        })
    }
}
