//! PBS batch-queue backend.
//!
//! Submits the cluster as a single batch job via `qsub` and tears it down
//! with `qdel`. The backend only forwards the resolved resource values;
//! worker bootstrap inside the allocation is the job command's business.
//!
//! Factory detection is deliberately lazy: machines without a PBS
//! toolchain never pay for it unless a profile asks for `type: pbs`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{ClusterBackend, ClusterHandle, ClusterSpec};
use crate::error::{ProfileError, Result};
use crate::resources::split_spec;

/// Backend submitting cluster jobs to a PBS scheduler
pub struct PbsBackend {
    qsub: PathBuf,
    qdel: PathBuf,
}

impl PbsBackend {
    /// Locate the PBS client tools, failing when they are not installed
    pub fn detect() -> Result<Self> {
        let qsub = find_on_path("qsub").ok_or_else(|| {
            ProfileError::Backend("PBS tools not found: 'qsub' is not on PATH".to_string())
        })?;
        let qdel = find_on_path("qdel").ok_or_else(|| {
            ProfileError::Backend("PBS tools not found: 'qdel' is not on PATH".to_string())
        })?;
        debug!("found PBS tools: {qsub:?}, {qdel:?}");

        Ok(Self { qsub, qdel })
    }

    /// Assemble the `qsub` argument list for a spec.
    ///
    /// Validates the resource-spec string as a side effect so malformed
    /// profiles fail before anything is submitted.
    fn submission_args(spec: &ClusterSpec) -> Result<Vec<String>> {
        let mut args = vec!["-N".to_string(), format!("hpcprofile-{}", spec.name)];

        if let Some(queue) = spec.str_param("queue") {
            args.push("-q".to_string());
            args.push(queue.to_string());
        }
        if let Some(resource_spec) = spec.str_param("resource_spec") {
            split_spec(resource_spec)?;
            args.push("-l".to_string());
            args.push(resource_spec.to_string());
        }
        if let Some(walltime) = spec.str_param("walltime") {
            args.push("-l".to_string());
            args.push(format!("walltime={walltime}"));
        }
        if let Some(extra) = spec.params.get("job_extra").and_then(|v| v.as_array()) {
            for item in extra {
                if let Some(text) = item.as_str() {
                    args.push(text.to_string());
                }
            }
        }

        Ok(args)
    }
}

#[async_trait]
impl ClusterBackend for PbsBackend {
    fn type_name(&self) -> &str {
        "pbs"
    }

    async fn spawn(&self, spec: ClusterSpec) -> Result<Box<dyn ClusterHandle>> {
        let args = Self::submission_args(&spec)?;
        let command = spec.str_param("command").ok_or_else(|| {
            ProfileError::Backend(
                "pbs backend: the profile must set 'cluster.command' to the job \
                 entry point (worker bootstrap is site-specific)"
                    .to_string(),
            )
        })?;

        info!("submitting PBS job for profile {:?}", spec.name);
        let output = Command::new(&self.qsub)
            .args(&args)
            .arg("--")
            .arg("/bin/sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProfileError::Backend(format!(
                "qsub failed: {}",
                stderr.trim()
            )));
        }

        let job_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("PBS job {job_id} submitted");

        Ok(Box::new(PbsCluster {
            address: format!("pbs://{job_id}"),
            job_id: Mutex::new(Some(job_id)),
            qdel: self.qdel.clone(),
            shutdown: watch::channel(false).0,
        }))
    }
}

/// Handle to a submitted PBS cluster job
pub struct PbsCluster {
    address: String,
    job_id: Mutex<Option<String>>,
    qdel: PathBuf,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl ClusterHandle for PbsCluster {
    fn scheduler_address(&self) -> &str {
        &self.address
    }

    fn workers(&self) -> usize {
        0
    }

    async fn scale(&self, _n: usize) -> Result<()> {
        Err(ProfileError::Backend(
            "pbs backend: the allocation is fixed at submission time".to_string(),
        ))
    }

    async fn wait_for_workers(&self, _n: usize) -> Result<()> {
        Err(ProfileError::Backend(
            "pbs backend: worker attachment is not observable from the submit host".to_string(),
        ))
    }

    async fn shutdown(&self) -> Result<()> {
        let job_id = self.job_id.lock().expect("pbs lock poisoned").take();
        if let Some(job_id) = job_id {
            info!("deleting PBS job {job_id}");
            let status = Command::new(&self.qdel).arg(&job_id).status().await?;
            if !status.success() {
                return Err(ProfileError::Backend(format!(
                    "qdel failed for job {job_id}"
                )));
            }
        }
        self.shutdown.send_replace(true);
        Ok(())
    }

    async fn finished(&self) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                return;
            }
        }
    }
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
