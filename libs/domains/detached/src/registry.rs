//! In-memory job bookkeeping for the detached service.
//!
//! Jobs live for the process lifetime; ids come from one monotonic counter.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::watch;

/// Lifecycle of one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Starting,
    Running,
    Done,
    Failed(String),
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed(_))
    }
}

/// One submitted job and its on-disk capture files.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    /// The code exactly as it will be executed (after `begin`/`end`
    /// stripping).
    pub code: String,
    pub code_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub submitted_at: DateTime<Utc>,
    state_rx: watch::Receiver<JobState>,
}

impl Job {
    pub fn state(&self) -> JobState {
        self.state_rx.borrow().clone()
    }

    /// Wait for the job to reach `Done` or `Failed`.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                // The runner hung up without a terminal state.
                return JobState::Failed("job runner vanished".to_string());
            }
        }
    }

    /// The submitted code with line numbers, as returned on failures.
    pub fn numbered_listing(&self) -> String {
        self.code
            .lines()
            .enumerate()
            .map(|(i, line)| format!("[{}] {}", i + 1, line))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Registry keyed by the job id's string form.
pub struct JobRegistry {
    next_id: AtomicU64,
    jobs: RwLock<HashMap<String, std::sync::Arc<Job>>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Record a job and hand back its handle together with the state sender
    /// the runner task reports through.
    pub fn insert(
        &self,
        id: u64,
        code: String,
        code_path: PathBuf,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
    ) -> (std::sync::Arc<Job>, watch::Sender<JobState>) {
        let (tx, rx) = watch::channel(JobState::Starting);
        let job = std::sync::Arc::new(Job {
            id,
            code,
            code_path,
            stdout_path,
            stderr_path,
            submitted_at: Utc::now(),
            state_rx: rx,
        });
        self.jobs
            .write()
            .expect("job registry lock poisoned")
            .insert(id.to_string(), job.clone());
        (job, tx)
    }

    pub fn get(&self, id: &str) -> Option<std::sync::Arc<Job>> {
        self.jobs
            .read()
            .expect("job registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().expect("job registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strip a leading `begin` line and its trailing matching `end` so block
/// expressions execute as plain scripts. Anything else passes through
/// byte-for-byte.
pub fn strip_begin_end(code: &str) -> String {
    let mut lines: Vec<&str> = code.lines().collect();

    let first_nonempty = match lines.iter().position(|l| !l.trim().is_empty()) {
        Some(i) => i,
        None => return code.to_string(),
    };
    if lines[first_nonempty].trim() != "begin" {
        return code.to_string();
    }

    let last_end = match lines.iter().rposition(|l| l.trim() == "end") {
        Some(i) if i > first_nonempty => i,
        _ => return code.to_string(),
    };

    lines.remove(last_end);
    lines.remove(first_nonempty);
    let mut stripped = lines.join("\n");
    if code.ends_with('\n') {
        stripped.push('\n');
    }
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let registry = JobRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert!(b > a);
    }

    #[test]
    fn test_insert_and_get_by_string_id() {
        let registry = JobRegistry::new();
        let id = registry.allocate_id();
        let (job, _tx) = registry.insert(
            id,
            "1 + 1".to_string(),
            PathBuf::from("/tmp/code"),
            PathBuf::from("/tmp/out"),
            PathBuf::from("/tmp/err"),
        );
        assert_eq!(job.state(), JobState::Starting);
        assert_eq!(registry.get(&id.to_string()).unwrap().id, id);
        assert!(registry.get("12345").is_none());
    }

    #[tokio::test]
    async fn test_wait_sees_terminal_state() {
        let registry = JobRegistry::new();
        let (job, tx) = registry.insert(
            1,
            String::new(),
            PathBuf::new(),
            PathBuf::new(),
            PathBuf::new(),
        );

        let waiter = tokio::spawn(async move { job.wait().await });
        tx.send(JobState::Running).unwrap();
        tx.send(JobState::Done).unwrap();
        assert_eq!(waiter.await.unwrap(), JobState::Done);
    }

    #[test]
    fn test_numbered_listing() {
        let registry = JobRegistry::new();
        let (job, _tx) = registry.insert(
            1,
            "x = 1\ny = 2".to_string(),
            PathBuf::new(),
            PathBuf::new(),
            PathBuf::new(),
        );
        assert_eq!(job.numbered_listing(), "[1] x = 1\n[2] y = 2");
    }

    #[test]
    fn test_strip_begin_end_block() {
        let code = "begin\n  x = 1\n  x + 1\nend\n";
        assert_eq!(strip_begin_end(code), "  x = 1\n  x + 1\n");
    }

    #[test]
    fn test_strip_preserves_plain_code() {
        let code = "x = 1\nx + 1\n";
        assert_eq!(strip_begin_end(code), code);
    }

    #[test]
    fn test_strip_handles_leading_blank_lines() {
        let code = "\n\nbegin\nwork()\nend";
        assert_eq!(strip_begin_end(code), "\n\nwork()");
    }

    #[test]
    fn test_strip_without_matching_end_is_untouched() {
        let code = "begin\nwork()\n";
        assert_eq!(strip_begin_end(code), code);
    }

    #[test]
    fn test_strip_keeps_inner_end_keywords() {
        let code = "begin\nfor i = 1:2\nend\nend\n";
        // Only the trailing `end` is removed.
        assert_eq!(strip_begin_end(code), "for i = 1:2\nend\n");
    }
}
