//! Stdio drivers: how bytes move between the gateway and a child process.
//!
//! Two implementations of one contract, chosen once at startup:
//!
//! - [`AsyncPipes`]: tokio process handles; stdout/stderr pumped by tasks.
//! - [`ThreadedPipes`]: `std::process` handles; every write runs on a
//!   blocking worker thread and stdout/stderr are pumped by dedicated threads,
//!   for platforms without native async child I/O.
//!
//! Callers only see [`StdioDriver`] and [`ChildIo`]. Stdout lines are pushed
//! into a [`LineSink`]; when stdout closes the sink is dropped, which is how
//! the owner learns the process is gone.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};

use super::launch::{LaunchSpec, inherited_env};
use crate::bridge::BridgeError;
use crate::config::StdioMode;

pub type LineSink = mpsc::UnboundedSender<String>;

/// A running child process.
#[async_trait]
pub trait ChildIo: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Write one framed message (a newline is appended). Concurrent writers
    /// never interleave: each line goes out whole under the stdin mutex.
    async fn write_line(&self, line: String) -> Result<(), BridgeError>;

    /// Close stdin, ask the process to exit, and force it after `grace`.
    async fn terminate(&self, grace: Duration);
}

pub trait StdioDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn spawn(
        &self,
        deployment_id: &str,
        launch: &LaunchSpec,
        env: &BTreeMap<String, String>,
        stdout: LineSink,
    ) -> Result<Box<dyn ChildIo>, BridgeError>;
}

/// Driver for the resolved mode (`Auto` is resolved by platform).
pub fn driver_for(mode: StdioMode) -> Arc<dyn StdioDriver> {
    match mode.resolve() {
        StdioMode::Threaded => Arc::new(ThreadedPipes),
        _ => Arc::new(AsyncPipes),
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        if e != nix::errno::Errno::ESRCH {
            tracing::warn!("failed to send SIGTERM to {}: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {
    // No polite signal here; closing stdin is the graceful request.
}

// ── Async pipes ─────────────────────────────────────────────────────────────

pub struct AsyncPipes;

struct AsyncChild {
    pid: Option<u32>,
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    child: Mutex<tokio::process::Child>,
}

impl StdioDriver for AsyncPipes {
    fn name(&self) -> &'static str {
        "async"
    }

    fn spawn(
        &self,
        deployment_id: &str,
        launch: &LaunchSpec,
        env: &BTreeMap<String, String>,
        stdout: LineSink,
    ) -> Result<Box<dyn ChildIo>, BridgeError> {
        let mut child = tokio::process::Command::new(&launch.program)
            .args(&launch.args)
            .env_clear()
            .envs(inherited_env())
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("'{}': {}", launch.display(), e)))?;

        let stdin = child.stdin.take();
        let out = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn("stdout not captured".to_string()))?;
        let err = child.stderr.take();

        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(out).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if stdout.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("stdout read failed: {}", e);
                        break;
                    }
                }
            }
        });

        if let Some(err) = err {
            let id = deployment_id.to_string();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(deployment_id = %id, "backend stderr: {}", line.trim_end());
                }
            });
        }

        Ok(Box::new(AsyncChild {
            pid: child.id(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
        }))
    }
}

#[async_trait]
impl ChildIo for AsyncChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write_line(&self, mut line: String) -> Result<(), BridgeError> {
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(BridgeError::Closed)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn terminate(&self, grace: Duration) {
        // Dropping stdin is the first, gentlest exit request. A writer stuck
        // on a full pipe keeps the lock; the signal below frees it.
        if let Ok(mut pipe) = self.stdin.try_lock() {
            pipe.take();
        }
        if let Some(pid) = self.pid {
            send_sigterm(pid);
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("backend exited: {}", status),
            Ok(Err(e)) => tracing::warn!("waiting for backend failed: {}", e),
            Err(_) => {
                tracing::warn!(
                    "backend pid {:?} ignored termination for {}s, killing",
                    self.pid,
                    grace.as_secs()
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!("kill failed: {}", e);
                }
            }
        }
    }
}

// ── Threaded pipes ──────────────────────────────────────────────────────────

pub struct ThreadedPipes;

struct ThreadedChild {
    pid: u32,
    stdin: Arc<std::sync::Mutex<Option<std::process::ChildStdin>>>,
    child: Arc<std::sync::Mutex<std::process::Child>>,
}

impl StdioDriver for ThreadedPipes {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn spawn(
        &self,
        deployment_id: &str,
        launch: &LaunchSpec,
        env: &BTreeMap<String, String>,
        stdout: LineSink,
    ) -> Result<Box<dyn ChildIo>, BridgeError> {
        let mut child = std::process::Command::new(&launch.program)
            .args(&launch.args)
            .env_clear()
            .envs(inherited_env())
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("'{}': {}", launch.display(), e)))?;

        let stdin = child.stdin.take();
        let out = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn("stdout not captured".to_string()))?;
        let err = child.stderr.take();

        std::thread::Builder::new()
            .name(format!("stdout-{deployment_id}"))
            .spawn(move || {
                for line in std::io::BufReader::new(out).lines() {
                    match line {
                        Ok(l) => {
                            if stdout.send(l).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("stdout read failed: {}", e);
                            break;
                        }
                    }
                }
            })?;

        if let Some(err) = err {
            let id = deployment_id.to_string();
            std::thread::Builder::new()
                .name(format!("stderr-{deployment_id}"))
                .spawn(move || {
                    for line in std::io::BufReader::new(err).lines().map_while(Result::ok) {
                        tracing::warn!(deployment_id = %id, "backend stderr: {}", line.trim_end());
                    }
                })?;
        }

        Ok(Box::new(ThreadedChild {
            pid: child.id(),
            stdin: Arc::new(std::sync::Mutex::new(stdin)),
            child: Arc::new(std::sync::Mutex::new(child)),
        }))
    }
}

#[async_trait]
impl ChildIo for ThreadedChild {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn write_line(&self, mut line: String) -> Result<(), BridgeError> {
        line.push('\n');
        let stdin = self.stdin.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = stdin.lock().unwrap_or_else(|p| p.into_inner());
            let pipe = guard.as_mut().ok_or(BridgeError::Closed)?;
            pipe.write_all(line.as_bytes())?;
            pipe.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| BridgeError::Io(std::io::Error::other(e)))?
    }

    async fn terminate(&self, grace: Duration) {
        let stdin = self.stdin.clone();
        let child = self.child.clone();
        let pid = self.pid;

        let joined = tokio::task::spawn_blocking(move || {
            match stdin.try_lock() {
                Ok(mut pipe) => drop(pipe.take()),
                Err(std::sync::TryLockError::Poisoned(p)) => drop(p.into_inner().take()),
                // A writer is blocked on a full pipe; the signal below frees it.
                Err(std::sync::TryLockError::WouldBlock) => {}
            }
            send_sigterm(pid);

            let mut child = child.lock().unwrap_or_else(|p| p.into_inner());
            let deadline = std::time::Instant::now() + grace;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::debug!("backend exited: {}", status);
                        return;
                    }
                    Ok(None) if std::time::Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("waiting for backend failed: {}", e);
                        break;
                    }
                }
            }

            tracing::warn!(
                "backend pid {} ignored termination for {}s, killing",
                pid,
                grace.as_secs()
            );
            if let Err(e) = child.kill() {
                tracing::warn!("kill failed: {}", e);
            }
            let _ = child.wait();
        })
        .await;

        if let Err(e) = joined {
            tracing::error!("terminate worker panicked: {}", e);
        }
    }
}

impl Drop for ThreadedChild {
    fn drop(&mut self) {
        // Mirror kill_on_drop for the async driver.
        let mut child = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
        }
    }
}
