use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessStatus, System};

/// PID record of a detached enforcement process
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `pid`
    pub fn write(&self, pid: u32) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, pid.to_string())
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    /// Get the recorded PID, if any
    pub fn read(&self) -> anyhow::Result<Option<u32>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        let pid = contents
            .trim()
            .parse::<u32>()
            .with_context(|| format!("Corrupt PID file: {}", self.path.display()))?;
        Ok(Some(pid))
    }

    /// Remove the PID file
    pub fn remove(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Whether the recorded process is still alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.read(), Ok(Some(pid)) if is_process_alive(pid))
    }
}

/// Whether `pid` names a live (non-zombie) process
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid)
        .is_some_and(|process| !matches!(process.status(), ProcessStatus::Zombie))
}

/// Ask the operating system to kill `pid`. Returns whether a signal was sent.
#[must_use]
pub fn kill_process(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return false;
    }
    sys.process(pid).is_some_and(sysinfo::Process::kill)
}
