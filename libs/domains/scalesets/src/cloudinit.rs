//! First-boot script assembly.
//!
//! Every provisioned instance runs one shell script from `customData`: mount
//! the temp disk, seed the worker user's git identity, optionally materialize
//! the master's package environment, then launch either a cluster worker or
//! the detached-job service.

use crate::error::ScaleSetResult;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// A package environment living on a non-default git branch; workers clone
/// and instantiate it before launching.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomEnvironment {
    pub remote: String,
    pub branch: String,
}

/// Inspect `project_dir` with git; a repo checked out on a branch other than
/// `main`/`master` is a custom environment the workers must reproduce.
pub fn detect_custom_environment(project_dir: &Path) -> Option<CustomEnvironment> {
    let git = |args: &[&str]| -> Option<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(project_dir)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    };

    let branch = git(&["rev-parse", "--abbrev-ref", "HEAD"])?;
    if branch == "main" || branch == "master" || branch == "HEAD" {
        return None;
    }
    let remote = git(&["remote", "get-url", "origin"])?;
    debug!(remote, branch, "Detected custom package environment");
    Some(CustomEnvironment { remote, branch })
}

/// How the worker process dials back to the master.
#[derive(Clone, Debug)]
pub struct WorkerLaunch<'a> {
    pub cookie: &'a str,
    pub master_addr: &'a str,
    pub master_port: u16,
    /// Worker processes per instance.
    pub ppi: usize,
    /// 0 = plain cluster worker; > 0 = `mpirun` with that many ranks.
    pub mpi_ranks: usize,
    pub mpi_flags: &'a str,
}

/// Inputs shared by the worker and detached script variants.
#[derive(Clone, Debug)]
pub struct StartupScript<'a> {
    /// Unix user the workload runs as.
    pub user: &'a str,
    pub exename: &'a str,
    pub exeflags: &'a str,
    /// Template-provided mkfs/mount preamble for the temp disk.
    pub tempdisk: &'a str,
    /// Environment exported into the workload shell.
    pub env: &'a BTreeMap<String, String>,
    pub nthreads: usize,
    /// Where `.gitconfig` / `.git-credentials` are read from (the master's
    /// home; injectable for tests).
    pub master_home: &'a Path,
    pub custom_environment: Option<&'a CustomEnvironment>,
}

impl StartupScript<'_> {
    fn header(&self) -> String {
        format!("#!/bin/sh\n{}\n", self.tempdisk)
    }

    /// Copy the master's git identity into the worker user's home so private
    /// package fetches work on first boot.
    fn git_seeding(&self) -> String {
        let mut script = String::new();

        if let Ok(gitconfig) = fs::read_to_string(self.master_home.join(".gitconfig")) {
            script.push_str(&format!(
                "sudo su - {user} <<'EOF_SU'\ncat > ~/.gitconfig <<'EOF_GITCONFIG'\n{gitconfig}\nEOF_GITCONFIG\nEOF_SU\n",
                user = self.user,
            ));
        }

        if let Ok(credentials) = fs::read_to_string(self.master_home.join(".git-credentials")) {
            script.push_str(&format!(
                "sudo su - {user} <<'EOF_SU'\ncat > ~/.git-credentials <<'EOF_CREDENTIALS'\n{credentials}\nEOF_CREDENTIALS\nchmod 600 ~/.git-credentials\nEOF_SU\n",
                user = self.user,
            ));
        }

        script
    }

    fn environment_block(&self) -> String {
        let custom = match self.custom_environment {
            Some(custom) => custom,
            None => return String::new(),
        };
        format!(
            "sudo su - {user} <<'EOF_SU'\n\
             if [ -d ~/project/.git ]; then\n\
                 cd ~/project && git fetch origin && git checkout {branch} && git pull\n\
             else\n\
                 git clone --branch {branch} {remote} ~/project\n\
             fi\n\
             {exename} --project=$HOME/project -e 'using Pkg; Pkg.instantiate(); Pkg.precompile()'\n\
             touch /tmp/julia_instantiate_done\n\
             EOF_SU\n",
            user = self.user,
            branch = custom.branch,
            remote = custom.remote,
            exename = self.exename,
        )
    }

    fn exports(&self) -> String {
        let mut exports = String::new();
        for (key, value) in self.env {
            exports.push_str(&format!("export {key}=\"{value}\"\n"));
        }
        exports.push_str(&format!("export JULIA_NUM_THREADS={}\n", self.nthreads));
        exports.push_str(&format!("export OMP_NUM_THREADS={}\n", self.nthreads));
        exports
    }
}

/// Render the first-boot script for a cluster (or MPI) worker instance.
pub fn build_worker_script(
    cfg: &StartupScript<'_>,
    launch: &WorkerLaunch<'_>,
) -> ScaleSetResult<String> {
    let mut script = cfg.header();
    script.push_str(&cfg.git_seeding());
    script.push_str(&cfg.environment_block());

    let run = if launch.mpi_ranks > 0 {
        format!(
            "mpirun -n {ranks} {flags} {exename} {exeflags} -e 'azure_worker_mpi(\"{cookie}\", \"{addr}\", {port}, {ppi})'",
            ranks = launch.mpi_ranks,
            flags = launch.mpi_flags,
            exename = cfg.exename,
            exeflags = cfg.exeflags,
            cookie = launch.cookie,
            addr = launch.master_addr,
            port = launch.master_port,
            ppi = launch.ppi,
        )
    } else {
        format!(
            "{exename} {exeflags} -e 'azure_worker(\"{cookie}\", \"{addr}\", {port}, {ppi})'",
            exename = cfg.exename,
            exeflags = cfg.exeflags,
            cookie = launch.cookie,
            addr = launch.master_addr,
            port = launch.master_port,
            ppi = launch.ppi,
        )
    };

    script.push_str(&format!(
        "sudo su - {user} <<'EOF_SU'\n{exports}cd $HOME\n{run}\nEOF_SU\n",
        user = cfg.user,
        exports = cfg.exports(),
    ));
    Ok(script)
}

/// Render the first-boot script for a detached-service VM: generate an SSH
/// key pair, then keep the HTTP service running on `port`.
pub fn build_detached_script(cfg: &StartupScript<'_>, port: u16) -> ScaleSetResult<String> {
    let mut script = cfg.header();
    script.push_str(&cfg.git_seeding());
    script.push_str(&cfg.environment_block());

    script.push_str(&format!(
        "sudo su - {user} <<'EOF_SU'\n\
         {exports}\
         mkdir -p ~/.ssh\n\
         [ -f ~/.ssh/id_rsa ] || ssh-keygen -q -t rsa -N '' -f ~/.ssh/id_rsa\n\
         cd $HOME\n\
         nohup detached-server --port {port} >> detached-server.log 2>&1 &\n\
         EOF_SU\n",
        user = cfg.user,
        exports = cfg.exports(),
    ));
    Ok(script)
}

/// Base64 of the rendered script, the form `osProfile.customData` expects.
pub fn encode_custom_data(script: &str) -> String {
    BASE64.encode(script)
}
