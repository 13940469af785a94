// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # OS Process Spawner
//!
//! Launches agent and connector workers as child processes of the
//! orchestrator and speaks newline-delimited JSON [`IpcMessage`]s over the
//! child's stdin (outbound) and stdout (inbound). Stderr is inherited so
//! worker logs land next to the orchestrator's.
//!
//! Each child is driven by three tasks on the tokio runtime:
//!
//! | Task | Role |
//! |------|------|
//! | writer | drains the handle's outbound queue into stdin, preserving order |
//! | reader | decodes stdout lines and forwards them to the [`MessageNotifier`] |
//! | supervisor | applies kill requests and reports the exit through the [`ExitNotifier`] |

use futures::{SinkExt, StreamExt};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::domain::ipc::IpcMessage;
use crate::domain::process::ProcessKey;
use crate::domain::spawner::{
    ExitNotifier, HandleError, MessageNotifier, ProcessChannel, ProcessHandle, ProcessSpawner,
    Signal, SpawnError, WorkerSpec,
};
use crate::domain::swarm_config::RunnerConfig;

/// Longest IPC line accepted from a worker (8 MiB).
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

pub struct CommandProcessSpawner {
    runner: RunnerConfig,
    runtime: Option<Handle>,
}

impl CommandProcessSpawner {
    /// Spawner that drives children on the runtime of the calling context.
    pub fn new(runner: RunnerConfig) -> Self {
        Self {
            runner,
            runtime: None,
        }
    }

    /// Spawner pinned to an explicit runtime.
    pub fn with_runtime(runner: RunnerConfig, runtime: Handle) -> Self {
        Self {
            runner,
            runtime: Some(runtime),
        }
    }

    fn launch(
        &self,
        command: &[String],
        worker_args: &[(&str, &str)],
        spec: &WorkerSpec,
        channel: ProcessChannel,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| SpawnError::NoRuntime)?,
        };
        let (program, leading_args) = command
            .split_first()
            .ok_or_else(|| SpawnError::Rejected("runner command is empty".to_string()))?;

        let key = channel.messages.key().clone();
        let mut cmd = Command::new(program);
        cmd.args(leading_args);
        for (flag, value) in worker_args {
            cmd.arg(flag).arg(value);
        }
        cmd.current_dir(&spec.bundle_dir)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Child reaping registers with the runtime's process driver.
        let _entered = runtime.enter();
        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;

        info!(process = %key, pid = ?pid, program = %program, "Worker process started");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let exited = Arc::new(AtomicBool::new(false));

        runtime.spawn(write_loop(key.clone(), stdin, outbound_rx));
        runtime.spawn(read_loop(stdout, channel.messages));
        runtime.spawn(supervise(child, pid, signal_rx, exited.clone(), channel.exit));

        Ok(Box::new(ChildHandle {
            pid,
            outbound: outbound_tx,
            signals: signal_tx,
            exited,
        }))
    }
}

impl ProcessSpawner for CommandProcessSpawner {
    fn spawn_agent(
        &self,
        agent_name: &str,
        instance_key: &str,
        spec: &WorkerSpec,
        channel: ProcessChannel,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        let bundle_dir = spec.bundle_dir.to_string_lossy();
        self.launch(
            &self.runner.agent_command,
            &[
                ("--bundle-dir", bundle_dir.as_ref()),
                ("--agent-name", agent_name),
                ("--instance-key", instance_key),
                ("--swarm-name", spec.swarm_name.as_str()),
            ],
            spec,
            channel,
        )
    }

    fn spawn_connector(
        &self,
        connector_name: &str,
        spec: &WorkerSpec,
        channel: ProcessChannel,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        let bundle_dir = spec.bundle_dir.to_string_lossy();
        self.launch(
            &self.runner.connector_command,
            &[
                ("--bundle-dir", bundle_dir.as_ref()),
                ("--connector-name", connector_name),
                ("--swarm-name", spec.swarm_name.as_str()),
            ],
            spec,
            channel,
        )
    }
}

struct ChildHandle {
    pid: Option<u32>,
    outbound: mpsc::UnboundedSender<String>,
    signals: mpsc::UnboundedSender<Signal>,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn send(&self, message: &IpcMessage) -> Result<(), HandleError> {
        if self.exited.load(Ordering::Acquire) {
            return Err(HandleError::Exited);
        }
        let line =
            serde_json::to_string(message).map_err(|e| HandleError::Encode(e.to_string()))?;
        self.outbound.send(line).map_err(|_| HandleError::Exited)
    }

    fn kill(&self, signal: Signal) {
        if self.signals.send(signal).is_err() {
            debug!(pid = ?self.pid, signal = signal.as_str(), "Kill requested after worker exited");
        }
    }
}

async fn write_loop(key: ProcessKey, stdin: ChildStdin, mut outbound: mpsc::UnboundedReceiver<String>) {
    let mut writer = FramedWrite::new(stdin, LinesCodec::new());
    while let Some(line) = outbound.recv().await {
        if let Err(e) = writer.send(line).await {
            debug!(process = %key, error = %e, "Worker stdin closed, dropping outbound messages");
            break;
        }
    }
}

async fn read_loop(stdout: ChildStdout, messages: MessageNotifier) {
    let mut reader = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<IpcMessage>(&line) {
                    Ok(message) => messages.deliver(message),
                    Err(e) => debug!(
                        process = %messages.key(),
                        error = %e,
                        "Dropping malformed IPC line from worker"
                    ),
                }
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(
                    process = %messages.key(),
                    max_bytes = MAX_LINE_BYTES,
                    "Dropping oversized IPC line from worker"
                );
            }
            Err(LinesCodecError::Io(e)) => {
                debug!(process = %messages.key(), error = %e, "Worker stdout closed");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exited: Arc<AtomicBool>,
    exit: ExitNotifier,
) {
    let mut handle_dropped = false;
    let status = loop {
        if handle_dropped {
            break child.wait().await;
        }
        tokio::select! {
            status = child.wait() => break status,
            signal = signals.recv() => match signal {
                Some(Signal::Term) => terminate(&mut child, pid),
                Some(Signal::Kill) => {
                    if let Err(e) = child.start_kill() {
                        debug!(pid = ?pid, error = %e, "SIGKILL delivery failed");
                    }
                }
                None => handle_dropped = true,
            },
        }
    };
    exited.store(true, Ordering::Release);

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(process = %exit.key(), error = %e, "Failed to collect worker exit status");
            None
        }
    };
    info!(process = %exit.key(), pid = ?pid, exit_code = ?code, "Worker process exited");
    exit.notify(code);
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: signalling a pid we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        debug!(pid = ?pid, error = %e, "Termination request failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::spawner::ProcessEventSink;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Collector {
        messages: Mutex<Vec<IpcMessage>>,
        exits: Mutex<Vec<Option<i32>>>,
        exited: Notify,
    }

    impl ProcessEventSink for Collector {
        fn on_message(&self, _key: &ProcessKey, _generation: u64, message: IpcMessage) {
            self.messages.lock().push(message);
        }

        fn on_exit(&self, _key: &ProcessKey, _generation: u64, code: Option<i32>) {
            self.exits.lock().push(code);
            self.exited.notify_one();
        }
    }

    fn shell_runner(script: &str) -> RunnerConfig {
        RunnerConfig {
            agent_command: vec!["sh".into(), "-c".into(), script.into(), "worker".into()],
            connector_command: vec!["sh".into(), "-c".into(), script.into(), "worker".into()],
            env: Default::default(),
        }
    }

    fn spec() -> WorkerSpec {
        WorkerSpec {
            swarm_name: "test-swarm".to_string(),
            bundle_dir: std::env::temp_dir(),
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_echo_worker_round_trips_ipc() {
        // `cat` echoes each line back, so outbound messages come back inbound.
        let spawner = CommandProcessSpawner::new(shell_runner("exec cat"));
        let collector = Arc::new(Collector::default());
        let sink: Arc<dyn ProcessEventSink> = collector.clone();
        let channel = ProcessChannel::new(&sink, ProcessKey::default_agent("echo"), 1);

        let handle = spawner.spawn_agent("echo", "default", &spec(), channel).unwrap();
        assert!(handle.pid().is_some());

        let ack = IpcMessage::shutdown_ack("echo", "default");
        handle.send(&ack).unwrap();

        for _ in 0..100 {
            if !collector.messages.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(collector.messages.lock().as_slice(), &[ack]);

        handle.kill(Signal::Term);
        tokio::time::timeout(Duration::from_secs(5), collector.exited.notified())
            .await
            .unwrap();
        assert_eq!(collector.exits.lock().len(), 1);
        assert!(matches!(handle.send(&IpcMessage::shutdown_ack("echo", "default")), Err(HandleError::Exited)));
    }

    #[tokio::test]
    async fn test_exit_code_is_reported_and_garbage_is_ignored() {
        let spawner = CommandProcessSpawner::new(shell_runner("echo 'not json'; exit 3"));
        let collector = Arc::new(Collector::default());
        let sink: Arc<dyn ProcessEventSink> = collector.clone();
        let channel = ProcessChannel::new(&sink, ProcessKey::connector("telegram"), 1);

        let _handle = spawner.spawn_connector("telegram", &spec(), channel).unwrap();
        tokio::time::timeout(Duration::from_secs(5), collector.exited.notified())
            .await
            .unwrap();

        assert_eq!(collector.exits.lock().as_slice(), &[Some(3)]);
        assert!(collector.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let runner = RunnerConfig {
            agent_command: vec!["/nonexistent/aegis-agent-runner".to_string()],
            ..RunnerConfig::default()
        };
        let spawner = CommandProcessSpawner::new(runner);
        let sink: Arc<dyn ProcessEventSink> = Arc::new(Collector::default());
        let channel = ProcessChannel::new(&sink, ProcessKey::default_agent("coder"), 1);

        let result = spawner.spawn_agent("coder", "default", &spec(), channel);
        assert!(matches!(result, Err(SpawnError::Io(_))));
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let spawner = CommandProcessSpawner::new(shell_runner("exit 0"));
        let sink: Arc<dyn ProcessEventSink> = Arc::new(Collector::default());
        let channel = ProcessChannel::new(&sink, ProcessKey::default_agent("coder"), 1);

        let result = spawner.spawn_agent("coder", "default", &spec(), channel);
        assert!(matches!(result, Err(SpawnError::NoRuntime)));
    }
}
