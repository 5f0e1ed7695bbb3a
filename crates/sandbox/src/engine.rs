//! Sandbox execution engine.
//!
//! [`ProcessSandbox`] runs one submitted program per call as a separate OS
//! process inside a fresh workspace. The child gets its own session, rlimits,
//! a rebuilt environment and (optionally) reduced credentials. Everything it
//! starts is killed once it exits; the worker enforces the wall-clock timeout
//! and the output cap itself.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

use coderunner_core::config::AppConfig;
use coderunner_core::{
    CodeExecutor, Error, ExecutionRequest, ExecutionResult, LanguageProfile, Result, NO_EXIT_CODE,
};
use coderunner_telemetry::{track_execution, ExecutionOutcome};

use crate::capture::OutputCapture;
use crate::limits::{self, ChildLimits};
use crate::runtime::{Invocation, RuntimeSpec};
use crate::workspace::{Workspace, SCRATCH_DIR};

/// `PATH` handed to children when the worker itself has none.
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long output may keep draining after the program has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for one language sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Profile of the language this sandbox executes.
    pub profile: LanguageProfile,
    /// Parent directory of per-request workspaces.
    pub workspace_root: PathBuf,
    /// Concurrent child processes; 0 means one per available CPU.
    pub max_concurrent: usize,
    /// Drop to this uid/gid before exec.
    pub run_as: Option<(u32, u32)>,
    /// Largest accepted source or stdin, in bytes.
    pub max_payload_bytes: usize,
}

impl SandboxConfig {
    /// Defaults for a profile: system temp dir, one slot per CPU, no uid drop.
    pub fn new(profile: LanguageProfile) -> Self {
        Self {
            profile,
            workspace_root: std::env::temp_dir().join("coderunner"),
            max_concurrent: 0,
            run_as: None,
            max_payload_bytes: 1024 * 1024,
        }
    }

    /// Sandbox for `profile` using the `[worker]` section of the app config.
    pub fn for_profile(config: &AppConfig, profile: LanguageProfile) -> Result<Self> {
        let run_as = match (config.worker.run_as_uid, config.worker.run_as_gid) {
            (Some(uid), Some(gid)) => Some((uid, gid)),
            (None, None) => None,
            _ => {
                return Err(Error::config(
                    "worker.run_as_uid and worker.run_as_gid must be set together",
                ))
            }
        };

        let mut sandbox = Self::new(profile);
        if let Some(root) = &config.worker.workspace_root {
            sandbox.workspace_root = root.clone();
        }
        sandbox.max_concurrent = config.worker.max_concurrent;
        sandbox.run_as = run_as;
        sandbox.max_payload_bytes = config.gateway.max_payload_bytes;
        Ok(sandbox)
    }

    /// Sandbox for the language named by `worker.language`.
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        let language = config.worker.language.trim().to_lowercase();
        let profile = config
            .language_profiles()
            .into_iter()
            .find(|p| p.matches(&language))
            .ok_or_else(|| Error::unsupported_language(language.clone()))?;
        Self::for_profile(config, profile)
    }

    /// Set the workspace root.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Set the concurrency cap.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Effective concurrency cap.
    pub fn concurrency(&self) -> usize {
        if self.max_concurrent > 0 {
            return self.max_concurrent;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Lifecycle of a single execution inside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Provisioning,
    Running,
    Finalizing,
    /// Killed by the wall-clock timer; reported, then cleaned up.
    TimedOut,
    /// Terminated by a signal; reported, then cleaned up.
    CrashExit,
}

impl WorkerPhase {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: WorkerPhase) -> bool {
        use WorkerPhase::*;
        matches!(
            (self, next),
            (Idle, Provisioning)
                | (Provisioning, Running)
                | (Provisioning, Finalizing)
                | (Running, Finalizing)
                | (Running, TimedOut)
                | (Running, CrashExit)
                | (Finalizing, Idle)
                | (TimedOut, Idle)
                | (CrashExit, Idle)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
            Self::TimedOut => "timed_out",
            Self::CrashExit => "crash_exit",
        }
    }
}

/// Tracks one execution's phase; returns to `Idle` when dropped.
struct PhaseTracker<'a> {
    request_id: &'a str,
    phase: WorkerPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(request_id: &'a str) -> Self {
        Self {
            request_id,
            phase: WorkerPhase::Idle,
        }
    }

    fn advance(&mut self, next: WorkerPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.phase,
            next
        );
        tracing::trace!(
            request_id = %self.request_id,
            from = self.phase.as_str(),
            to = next.as_str(),
            "Sandbox phase"
        );
        self.phase = next;
    }
}

impl Drop for PhaseTracker<'_> {
    fn drop(&mut self) {
        match self.phase {
            WorkerPhase::Idle => {}
            // Dropped mid-flight: the execution future was cancelled.
            WorkerPhase::Provisioning | WorkerPhase::Running => {
                tracing::debug!(request_id = %self.request_id, "Execution abandoned");
                self.phase = WorkerPhase::Idle;
            }
            _ => self.advance(WorkerPhase::Idle),
        }
    }
}

/// How one spawned step ended.
struct StepOutput {
    capture: OutputCapture,
    exit_code: i32,
    timed_out: bool,
    signalled: bool,
}

// =============================================================================
// Process Sandbox
// =============================================================================

/// Executes programs of one language as isolated child processes.
///
/// Dropping an in-flight `execute` future kills the child's whole process
/// group and removes its workspace.
pub struct ProcessSandbox {
    config: SandboxConfig,
    runtime: RuntimeSpec,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
}

impl ProcessSandbox {
    /// Sandbox using the built-in runtime for the profile's language.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let runtime = RuntimeSpec::builtin(&config.profile.id)
            .ok_or_else(|| Error::unsupported_language(config.profile.id.clone()))?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Sandbox using an explicit runtime.
    pub fn with_runtime(config: SandboxConfig, runtime: RuntimeSpec) -> Self {
        limits::enable_subreaper();
        let permits = Arc::new(Semaphore::new(config.concurrency()));
        Self {
            config,
            runtime,
            permits,
            active: AtomicUsize::new(0),
        }
    }

    pub fn profile(&self) -> &LanguageProfile {
        &self.config.profile
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Whether the runtime binary is on `PATH`.
    pub fn runtime_available(&self) -> bool {
        self.runtime.is_installed()
    }

    /// Name of the binary the runtime needs.
    pub fn runtime_program(&self) -> &str {
        self.runtime.required_program()
    }

    /// Executions currently holding a slot.
    pub fn active_executions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Timeout actually applied for a caller's requested value.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ceiling = self.config.profile.timeout_ms;
        let ms = requested_ms
            .filter(|ms| *ms > 0)
            .map_or(ceiling, |ms| ms.min(ceiling));
        Duration::from_millis(ms)
    }

    /// Execute one request, honoring a caller-requested timeout up to the
    /// profile's ceiling.
    pub async fn run(
        &self,
        request: ExecutionRequest,
        timeout_ms: Option<u64>,
    ) -> Result<ExecutionResult> {
        let timeout = self.effective_timeout(timeout_ms);
        let language = self.config.profile.id.clone();

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::internal("sandbox is shutting down"))?;
        let _slot = ActiveSlot::acquire(&self.active);

        let started = Instant::now();
        let result = self.run_in_workspace(&request, timeout, started).await;

        match &result {
            Ok(result) => {
                track_execution(&language, ExecutionOutcome::of(result), result.duration_ms);
                tracing::info!(
                    request_id = %request.id,
                    language = %language,
                    exit_code = result.exit_code,
                    duration_ms = result.duration_ms,
                    timed_out = result.timed_out,
                    truncated = result.truncated,
                    "Execution finished"
                );
            }
            Err(e) => {
                track_execution(
                    &language,
                    ExecutionOutcome::Failed,
                    started.elapsed().as_millis() as u64,
                );
                tracing::warn!(request_id = %request.id, language = %language, error = %e, "Execution failed");
            }
        }
        result
    }

    async fn run_in_workspace(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let mut phase = PhaseTracker::new(&request.id);

        // Checked before provisioning so a missing runtime leaves nothing behind.
        if !self.runtime.is_installed() {
            return Err(Error::RuntimeMissing(self.runtime.required_program().to_string()));
        }

        phase.advance(WorkerPhase::Provisioning);
        let workspace = match self.provision(request) {
            Ok(workspace) => workspace,
            Err(e) => {
                phase.advance(WorkerPhase::Finalizing);
                return Err(e);
            }
        };

        phase.advance(WorkerPhase::Running);
        let deadline = tokio::time::Instant::now() + timeout;
        let memory = self.config.profile.memory_limit_bytes;
        let env = self.environment(workspace.path());

        let mut last = None;
        for invocation in self.runtime.invocations(workspace.path(), memory) {
            let stdin = if invocation.is_final {
                request.stdin.as_deref()
            } else {
                None
            };
            let output = match self
                .run_step(&invocation, workspace.path(), &env, stdin, deadline)
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    phase.advance(WorkerPhase::Finalizing);
                    return Err(e);
                }
            };
            // A failed compile step ends the execution with its output.
            let stop = output.timed_out || output.exit_code != 0;
            last = Some(output);
            if stop {
                break;
            }
        }

        let Some(output) = last else {
            phase.advance(WorkerPhase::Finalizing);
            return Err(Error::internal("runtime has no steps"));
        };

        phase.advance(if output.timed_out {
            WorkerPhase::TimedOut
        } else if output.signalled {
            WorkerPhase::CrashExit
        } else {
            WorkerPhase::Finalizing
        });

        let duration_ms = started.elapsed().as_millis() as u64;
        let truncated = output.capture.truncated();
        let (stdout, stderr) = output.capture.into_text();
        let mut result =
            ExecutionResult::completed(&request.id, stdout, stderr, output.exit_code, duration_ms);
        result.timed_out = output.timed_out;
        result.truncated = truncated;

        drop(workspace);
        Ok(result)
    }

    fn provision(&self, request: &ExecutionRequest) -> Result<Workspace> {
        let workspace = Workspace::create(
            &self.config.workspace_root,
            &self.config.profile.id,
            &request.id,
            self.config.run_as,
        )?;
        let source = workspace.write_source(&self.runtime.source_file, &request.source_code)?;
        if let Some((uid, gid)) = self.config.run_as {
            std::os::unix::fs::chown(&source, Some(uid), Some(gid))
                .map_err(|e| Error::workspace(format!("cannot chown source: {}", e)))?;
        }
        Ok(workspace)
    }

    fn environment(&self, workspace: &Path) -> Vec<(String, String)> {
        let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let mut env = vec![
            ("PATH".to_string(), path),
            ("HOME".to_string(), workspace.to_string_lossy().into_owned()),
            (
                "TMPDIR".to_string(),
                workspace.join(SCRATCH_DIR).to_string_lossy().into_owned(),
            ),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        env.extend(
            self.runtime
                .environment(workspace, self.config.profile.memory_limit_bytes),
        );
        env
    }

    async fn run_step(
        &self,
        invocation: &Invocation,
        workspace: &Path,
        env: &[(String, String)],
        stdin: Option<&str>,
        deadline: tokio::time::Instant,
    ) -> Result<StepOutput> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(workspace)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        limits::apply(
            &mut cmd,
            ChildLimits::new(invocation.address_space_limit),
            self.config.run_as,
        );

        let (mut child, tree) = limits::spawn_contained(&mut cmd).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::RuntimeMissing(invocation.program.clone())
            } else {
                Error::worker(format!("failed to spawn {}: {}", invocation.program, e))
            }
        })?;

        let child_stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut capture = OutputCapture::new(self.config.profile.max_output_bytes);

        let outcome = {
            let exited = async {
                let feed = async {
                    if let (Some(mut pipe), Some(input)) = (child_stdin, stdin) {
                        // EPIPE just means the program stopped reading.
                        let _ = pipe.write_all(input.as_bytes()).await;
                    }
                };
                let wait = async {
                    let status = child.wait().await;
                    // Nothing the program started outlives it.
                    tree.kill();
                    status
                };
                let ((), status) = tokio::join!(feed, wait);
                status
            };
            let drain = capture.drain(stdout, stderr);
            tokio::pin!(exited);
            tokio::pin!(drain);

            let io = async {
                let mut drained = false;
                let status = tokio::select! {
                    status = &mut exited => status,
                    () = &mut drain => {
                        drained = true;
                        (&mut exited).await
                    }
                };
                // Once the program is gone its exit status stands, whoever
                // still holds the pipes.
                if !drained && tokio::time::timeout(EXIT_DRAIN_GRACE, &mut drain).await.is_err() {
                    tracing::warn!(
                        program = %invocation.program,
                        "Output pipes still open after exit; discarding the rest"
                    );
                }
                status
            };
            tokio::time::timeout_at(deadline, io).await
        };

        match outcome {
            Ok(Ok(status)) => Ok(StepOutput {
                capture,
                exit_code: exit_code(status),
                timed_out: false,
                signalled: status.code().is_none(),
            }),
            Ok(Err(e)) => Err(Error::worker(format!(
                "failed to wait for {}: {}",
                invocation.program, e
            ))),
            Err(_) => {
                tree.kill();
                let _ = child.wait().await;
                Ok(StepOutput {
                    capture,
                    exit_code: NO_EXIT_CODE,
                    timed_out: true,
                    signalled: false,
                })
            }
        }
    }
}

#[async_trait]
impl CodeExecutor for ProcessSandbox {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.run(request, None).await
    }
}

/// Exit code, or `128 + signal` for a signalled child.
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(NO_EXIT_CODE)
}

struct ActiveSlot<'a>(&'a AtomicUsize);

impl<'a> ActiveSlot<'a> {
    fn acquire(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
