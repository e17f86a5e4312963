use serde::{Deserialize, Serialize};

/// Identity of the VM hosting a detached service. Served by
/// `GET /cofii/detached/vm` so a client holding only an IP can recover the
/// full identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedVm {
    pub name: String,
    pub ip: String,
    pub subscriptionid: String,
    pub resourcegroup: String,
}

/// `POST /cofii/detached/run` request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub code: Option<String>,
    /// false = the VM deletes itself once this job finishes.
    #[serde(default = "default_persist")]
    pub persist: bool,
    /// base64 of a JSON object bound into the job's environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variablebundle: Option<String>,
}

fn default_persist() -> bool {
    true
}

/// `POST /cofii/detached/run` response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub id: u64,
}

/// Client-side handle on a submitted job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetachedJob {
    pub vm: DetachedVm,
    pub id: String,
    pub log_url: String,
}

/// Which captured stream to read back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}
