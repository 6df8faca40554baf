// src/supervise/mod.rs

//! Process supervision core: spawn a child, drain both output streams
//! concurrently, and enforce the layered timeout policy (inactivity timeout,
//! soft deadline signal, grace period, hard kill).
//!
//! The only public entry point is [`Supervisor::run`]. Everything the caller
//! needs to know about the outcome is in the returned [`ExecutionResult`];
//! timeouts are normal terminal states, not errors.

pub mod controller;
pub mod drain;
pub mod ptree;
pub mod queue;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use std::process::Stdio;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};

use crate::errors::SuperviseError;

pub use ptree::{kill_children, ProcessTree, SystemProcessTree};
pub use queue::{QueueEntry, StreamSource};

/// Sentinel exit code reported when an execution dies on the fatal
/// OS-error path rather than through a normal exit or kill.
pub const FATAL_EXIT_CODE: i32 = -99;

/// Default poll interval, i.e. one "tick" of the controller loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Signal sent when the soft deadline is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TermSignal {
    Hup,
    Int,
    #[default]
    Term,
    Kill,
}

impl TermSignal {
    #[cfg(unix)]
    pub fn as_raw(self) -> i32 {
        match self {
            TermSignal::Hup => libc::SIGHUP,
            TermSignal::Int => libc::SIGINT,
            TermSignal::Term => libc::SIGTERM,
            TermSignal::Kill => libc::SIGKILL,
        }
    }

    #[cfg(not(unix))]
    pub fn as_raw(self) -> i32 {
        match self {
            TermSignal::Hup => 1,
            TermSignal::Int => 2,
            TermSignal::Kill => 9,
            TermSignal::Term => 15,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TermSignal::Hup => "SIGHUP",
            TermSignal::Int => "SIGINT",
            TermSignal::Term => "SIGTERM",
            TermSignal::Kill => "SIGKILL",
        }
    }
}

impl FromStr for TermSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hup" | "sighup" => Ok(TermSignal::Hup),
            "int" | "sigint" => Ok(TermSignal::Int),
            "term" | "sigterm" => Ok(TermSignal::Term),
            "kill" | "sigkill" => Ok(TermSignal::Kill),
            other => Err(format!(
                "invalid signal name: {other} (expected hup, int, term or kill)"
            )),
        }
    }
}

impl std::fmt::Display for TermSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Absolute deadline of an execution: either a duration from now or an
/// explicit wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    In(Duration),
    At(SystemTime),
}

impl Deadline {
    /// Pin the deadline against a monotonic `now`. A timestamp already in
    /// the past resolves to `now` and fires on the first iteration.
    pub fn resolve(&self, now: Instant) -> Instant {
        match self {
            Deadline::In(d) => now + *d,
            Deadline::At(when) => match when.duration_since(SystemTime::now()) {
                Ok(d) => now + d,
                Err(_) => now,
            },
        }
    }
}

/// Where the execution stands relative to its deadline. The soft signal is
/// sent exactly once, on the `NotReached -> SignalSent` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlineStatus {
    #[default]
    NotReached,
    /// The deadline was crossed and the termination signal has been sent.
    SignalSent,
    /// The grace period after the deadline has been entered or exhausted.
    Expired,
}

impl DeadlineStatus {
    pub fn reached(self) -> bool {
        !matches!(self, DeadlineStatus::NotReached)
    }
}

/// Everything needed to run one supervised execution. Immutable once
/// [`Supervisor::run`] starts.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Idle ticks tolerated before the child is assumed stuck and killed.
    pub progressive_timeout: u64,
    /// Absolute deadline; `None` means `10 * progressive_timeout` ticks.
    pub deadline: Option<Deadline>,
    /// Extra ticks after the deadline before the hard kill.
    pub grace_period: u64,
    pub signal: TermSignal,
    /// Length of one controller tick.
    pub poll_interval: Duration,
    /// Caller-supplied identifier; generated when left empty.
    pub identifier: String,
}

impl ExecutionRequest {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            progressive_timeout: 60,
            deadline: None,
            grace_period: 180,
            signal: TermSignal::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            identifier: String::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn progressive_timeout(mut self, ticks: u64) -> Self {
        self.progressive_timeout = ticks;
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn grace_period(mut self, ticks: u64) -> Self {
        self.grace_period = ticks;
        self
    }

    pub fn signal(mut self, signal: TermSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn identifier(mut self, id: impl Into<String>) -> Self {
        self.identifier = id.into();
        self
    }

    /// Where the deadline lands on the monotonic clock, applying the
    /// `10 * progressive_timeout` ticks default when none was given.
    pub fn deadline_instant(&self, now: Instant) -> Instant {
        match &self.deadline {
            Some(deadline) => deadline.resolve(now),
            None => {
                now + ticks_duration(
                    self.poll_interval,
                    self.progressive_timeout.saturating_mul(10),
                )
            }
        }
    }

    /// Grace period expressed as wall-clock time.
    pub fn grace_duration(&self) -> Duration {
        ticks_duration(self.poll_interval, self.grace_period)
    }

    fn effective_identifier(&self) -> String {
        if !self.identifier.is_empty() {
            return self.identifier.clone();
        }
        let stem = self
            .program
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "child".to_string());
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        format!("{stem}-{nanos:08x}")
    }
}

/// A tick count as wall-clock time, saturating instead of overflowing for
/// absurdly large counts.
fn ticks_duration(poll: Duration, ticks: u64) -> Duration {
    poll.saturating_mul(u32::try_from(ticks).unwrap_or(u32::MAX))
}

/// Mutable per-run context handed to the line handler and the report sink.
#[derive(Debug)]
pub struct RunContext {
    pub identifier: String,
    pub pid: u32,
    /// Human-readable status messages accumulated over the run.
    pub messages: Vec<String>,
}

impl RunContext {
    pub fn new(identifier: String, pid: u32) -> Self {
        Self {
            identifier,
            pid,
            messages: Vec::new(),
        }
    }

    /// Record a human-visible status line; also emitted through `tracing`.
    pub fn add_message(&mut self, text: impl Into<String>, is_error: bool) {
        let text = text.into();
        if is_error {
            error!(identifier = %self.identifier, "{text}");
        } else {
            info!(identifier = %self.identifier, "{text}");
        }
        self.messages.push(text);
    }
}

/// Outcome of one supervised execution.
///
/// Timeouts and the fatal OS-error path are reported here, never as `Err`
/// from [`Supervisor::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// The inactivity (progressive) timeout fired and the child was killed.
    pub timed_out: bool,
    pub deadline: DeadlineStatus,
    pub exit_code: Option<i32>,
    /// Accumulated result of the line handler over all lines.
    pub matched: bool,
    /// An unexpected OS-level error aborted the execution; `exit_code`
    /// carries [`FATAL_EXIT_CODE`].
    pub fatal: bool,
    pub messages: Vec<String>,
}

/// Handler that logs every line and matches nothing.
///
/// Handlers are invoked once per poll tick with a real queue entry, or
/// `None` on an idle tick; their boolean returns for real lines are OR-ed
/// into [`ExecutionResult::matched`].
pub fn default_line_handler(
    _tick: u64,
    entry: Option<&QueueEntry>,
    ctx: &mut RunContext,
) -> bool {
    if let Some(e @ QueueEntry::Line { source, .. }) = entry {
        info!(
            identifier = %ctx.identifier,
            stream = source.label(),
            line = %e.text(),
        );
    }
    false
}

/// Handler that logs every line and reports whether any line matched the
/// given pattern.
pub fn pattern_line_handler(
    pattern: regex::Regex,
) -> impl FnMut(u64, Option<&QueueEntry>, &mut RunContext) -> bool + Send {
    move |_tick, entry, ctx| match entry {
        Some(e @ QueueEntry::Line { source, .. }) => {
            let line = e.text();
            info!(
                identifier = %ctx.identifier,
                stream = source.label(),
                line = %line,
            );
            pattern.is_match(&line)
        }
        _ => false,
    }
}

/// Spawns and supervises child executions. Owns the platform process-tree
/// capability; one instance can be reused across runs, but each run has
/// exactly one controller loop owning the child's lifecycle.
pub struct Supervisor {
    tree: Box<dyn ProcessTree>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            tree: Box::new(SystemProcessTree::new()),
        }
    }

    /// Swap in a different process-tree capability (used by tests).
    pub fn with_tree(tree: Box<dyn ProcessTree>) -> Self {
        Self { tree }
    }

    /// Run one supervised execution to completion.
    ///
    /// `Err` is returned only when the child cannot be spawned or wired up;
    /// every runtime outcome, including timeouts and fatal stream errors,
    /// comes back as an [`ExecutionResult`]. Both drainer tasks are joined
    /// before this returns, on every path.
    pub async fn run<H>(
        &self,
        request: &ExecutionRequest,
        handler: &mut H,
    ) -> Result<ExecutionResult, SuperviseError>
    where
        H: FnMut(u64, Option<&QueueEntry>, &mut RunContext) -> bool + Send,
    {
        let identifier = request.effective_identifier();

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| SuperviseError::Spawn {
            program: request.program.display().to_string(),
            source,
        })?;
        let pid = child.id().ok_or(SuperviseError::NoPid)?;

        info!(
            identifier = %identifier,
            pid,
            program = %request.program.display(),
            args = ?request.args,
            "launching supervised process"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or(SuperviseError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SuperviseError::MissingPipe("stderr"))?;

        let (tx, mut rx) = queue::channel();
        let stdout_drainer = drain::spawn_drainer(
            stdout,
            StreamSource::Stdout,
            tx.clone(),
            identifier.clone(),
        );
        let stderr_drainer =
            drain::spawn_drainer(stderr, StreamSource::Stderr, tx, identifier.clone());

        let mut ctx = RunContext::new(identifier.clone(), pid);
        let outcome = controller::run_loop(
            request,
            &mut child,
            &mut rx,
            self.tree.as_ref(),
            &mut ctx,
            handler,
        )
        .await;

        // Join both drainers on every exit path. A surviving descendant can
        // keep a pipe write end open past the child's death, so the joins
        // are bounded and a blocked drainer is aborted rather than awaited.
        let join_grace = request.poll_interval.saturating_mul(2);
        join_drainer(stdout_drainer, join_grace, &identifier).await;
        join_drainer(stderr_drainer, join_grace, &identifier).await;
        info!(identifier = %identifier, "drainers joined, execution finished");

        Ok(ExecutionResult {
            timed_out: outcome.timed_out,
            deadline: outcome.deadline,
            exit_code: outcome.exit_code,
            matched: outcome.matched,
            fatal: outcome.fatal,
            messages: ctx.messages,
        })
    }
}

async fn join_drainer(mut handle: JoinHandle<()>, grace: Duration, identifier: &str) {
    if time::timeout(grace, &mut handle).await.is_err() {
        warn!(
            identifier = %identifier,
            "drainer blocked on a still-open pipe, aborting"
        );
        handle.abort();
        let _ = handle.await;
    }
}
