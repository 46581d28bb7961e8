//! Process-backed worker runner

use super::classifier::{classify_line, TurnEnd};
use super::{EventSender, HealthStatus, WorkerHandle, WorkerRunner};
use crate::config::{WorkerConfig, WorkerSpec};
use crate::core_types::{AttachmentKind, ExecutionOutcome, PromptPayload, WorkerEvent};
use crate::errors::RelayError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

struct CliWorker {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Lines<BufReader<ChildStdout>>>,
}

/// Runs the configured assistant CLI as a long-lived child process per session,
/// speaking stream-JSON over its stdin and stdout.
pub struct CliWorkerRunner {
    config: WorkerConfig,
    workers: DashMap<String, Arc<CliWorker>>,
}

impl CliWorkerRunner {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            workers: DashMap::new(),
        }
    }

    fn worker(&self, handle: &WorkerHandle) -> Result<Arc<CliWorker>, RelayError> {
        self.workers
            .get(&handle.id)
            .map(|w| w.value().clone())
            .ok_or_else(|| RelayError::WorkerCrash {
                session_id: handle.session_id.clone(),
                message: "worker is no longer running".to_string(),
            })
    }

    fn is_soft_stop(&self, status: &ExitStatus) -> bool {
        if let Some(code) = status.code() {
            return self.config.soft_stop_exit_codes.contains(&code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return self.config.soft_stop_signals.contains(&signal);
            }
        }
        false
    }

    /// The worker closed stdout mid-turn. Either a soft stop or a crash.
    async fn turn_ended_by_exit(
        &self,
        handle: &WorkerHandle,
        worker: &CliWorker,
        events: &EventSender,
        partial_len: usize,
    ) -> Result<ExecutionOutcome, RelayError> {
        let status = worker.child.lock().await.wait().await;
        handle.activity.mark_exited();

        let status = status.map_err(|e| RelayError::WorkerCrash {
            session_id: handle.session_id.clone(),
            message: format!("failed to reap worker: {}", e),
        })?;

        if self.is_soft_stop(&status) {
            log::info!(
                "Worker for session '{}' soft-stopped ({}); discarding {} chars of partial output",
                handle.session_id,
                status,
                partial_len
            );
            let _ = events.send(WorkerEvent::SoftStop {
                reason: status.to_string(),
            });
            return Ok(ExecutionOutcome::SoftStopped {
                text: self.config.soft_stop_message.clone(),
            });
        }

        log::error!(
            "Worker for session '{}' exited mid-turn: {}",
            handle.session_id,
            status
        );
        Err(RelayError::WorkerCrash {
            session_id: handle.session_id.clone(),
            message: format!("worker exited with {}", status),
        })
    }

    async fn read_turn(
        &self,
        handle: &WorkerHandle,
        worker: &CliWorker,
        events: &EventSender,
    ) -> Result<ExecutionOutcome, RelayError> {
        let mut stdout = worker.stdout.lock().await;
        let mut partial = String::new();

        loop {
            let next = stdout.next_line().await;
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    drop(stdout);
                    return self
                        .turn_ended_by_exit(handle, worker, events, partial.len())
                        .await;
                }
                Err(e) => {
                    return Err(RelayError::WorkerCrash {
                        session_id: handle.session_id.clone(),
                        message: format!("failed to read worker output: {}", e),
                    })
                }
            };

            handle.activity.record_output();
            let classified = classify_line(&line, &self.config.soft_stop_subtypes);
            for event in classified.events {
                if let WorkerEvent::PlainText { text } = &event {
                    if !partial.is_empty() {
                        partial.push('\n');
                    }
                    partial.push_str(text);
                }
                let _ = events.send(event);
            }

            match classified.end {
                None => continue,
                Some(TurnEnd::Success { text }) => {
                    return Ok(ExecutionOutcome::Completed {
                        text: text.filter(|t| !t.is_empty()).unwrap_or(partial),
                    })
                }
                Some(TurnEnd::SoftStop { subtype }) => {
                    log::info!(
                        "Worker for session '{}' reached a limit ({}); discarding partial output",
                        handle.session_id,
                        subtype
                    );
                    return Ok(ExecutionOutcome::SoftStopped {
                        text: self.config.soft_stop_message.clone(),
                    });
                }
                Some(TurnEnd::Failure { message }) => {
                    return Ok(ExecutionOutcome::Failed { message })
                }
            }
        }
    }
}

#[async_trait]
impl WorkerRunner for CliWorkerRunner {
    async fn spawn(&self, spec: &WorkerSpec) -> Result<WorkerHandle, RelayError> {
        if !spec.working_directory.is_dir() {
            return Err(RelayError::SpawnError(format!(
                "working directory {} does not exist",
                spec.working_directory.display()
            )));
        }

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RelayError::SpawnError(format!("{}: {}", spec.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::SpawnError("worker stdin missing".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::SpawnError("worker stdout missing".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let session_id = spec.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[worker {}] {}", session_id, line);
                }
            });
        }

        let handle = WorkerHandle::new(&spec.session_id, child.id());
        log::info!(
            "Spawned worker pid {:?} for session '{}' in {}",
            handle.pid,
            spec.session_id,
            spec.working_directory.display()
        );

        self.workers.insert(
            handle.id.clone(),
            Arc::new(CliWorker {
                child: Mutex::new(child),
                stdin: Mutex::new(Some(stdin)),
                stdout: Mutex::new(BufReader::new(stdout).lines()),
            }),
        );
        Ok(handle)
    }

    async fn execute(
        &self,
        handle: &WorkerHandle,
        prompt: &PromptPayload,
        events: EventSender,
    ) -> Result<ExecutionOutcome, RelayError> {
        let worker = self.worker(handle)?;
        if handle.activity.has_exited() {
            return Err(RelayError::WorkerCrash {
                session_id: handle.session_id.clone(),
                message: "worker has exited".to_string(),
            });
        }

        let mut line = prompt_line(prompt)?;
        line.push('\n');

        handle.activity.begin_turn();
        let written = {
            let mut stdin = worker.stdin.lock().await;
            match stdin.as_mut() {
                Some(stdin) => match stdin.write_all(line.as_bytes()).await {
                    Ok(()) => stdin.flush().await,
                    Err(e) => Err(e),
                },
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "worker stdin closed",
                )),
            }
        };

        let outcome = match written {
            Ok(()) => self.read_turn(handle, &worker, &events).await,
            Err(e) => Err(RelayError::WorkerCrash {
                session_id: handle.session_id.clone(),
                message: format!("failed to write prompt: {}", e),
            }),
        };
        handle.activity.end_turn();
        outcome
    }

    async fn health_check(&self, handle: &WorkerHandle) -> HealthStatus {
        let worker = match self.worker(handle) {
            Ok(worker) => worker,
            Err(_) => return HealthStatus::Dead,
        };

        // `try_lock` keeps the health check from queueing behind a reaping `wait()`.
        if let Ok(mut child) = worker.child.try_lock() {
            if let Ok(Some(status)) = child.try_wait() {
                log::debug!(
                    "Worker for session '{}' has exited: {}",
                    handle.session_id,
                    status
                );
                handle.activity.mark_exited();
            }
        }
        handle.activity.health(self.config.stall_threshold())
    }

    async fn shutdown(&self, handle: &WorkerHandle) {
        let Some((_, worker)) = self.workers.remove(&handle.id) else {
            return;
        };

        worker.stdin.lock().await.take();
        let mut child = worker.child.lock().await;
        if let Err(e) = child.start_kill() {
            log::debug!("Kill for session '{}' worker: {}", handle.session_id, e);
        }
        match tokio::time::timeout(self.config.shutdown_grace(), child.wait()).await {
            Ok(Ok(status)) => log::info!(
                "Worker for session '{}' shut down ({})",
                handle.session_id,
                status
            ),
            Ok(Err(e)) => log::warn!(
                "Failed to reap worker for session '{}': {}",
                handle.session_id,
                e
            ),
            Err(_) => log::warn!(
                "Worker for session '{}' did not exit within {:?}",
                handle.session_id,
                self.config.shutdown_grace()
            ),
        }
        handle.activity.mark_exited();
    }
}

/// Encode a prompt as one stream-JSON user message.
pub fn prompt_line(prompt: &PromptPayload) -> Result<String, RelayError> {
    let mut content: Vec<Value> = vec![json!({"type": "text", "text": prompt.text})];

    for attachment in &prompt.attachments {
        let is_image = attachment
            .mime_type
            .as_deref()
            .map(|m| m.starts_with("image/"))
            .unwrap_or(false);

        let block = match attachment.kind {
            AttachmentKind::Inline if is_image => json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": attachment.mime_type,
                    "data": attachment.content,
                }
            }),
            AttachmentKind::Inline => json!({
                "type": "text",
                "text": format!("Attachment {}:\n{}", attachment.name, attachment.content),
            }),
            AttachmentKind::FilePath => json!({
                "type": "text",
                "text": format!("Attached file {} at {}", attachment.name, attachment.content),
            }),
        };
        content.push(block);
    }

    let line = json!({
        "type": "user",
        "message": {"role": "user", "content": content},
    });
    Ok(serde_json::to_string(&line)?)
}
