// src/supervise/controller.rs

//! The timeout/deadline controller loop.
//!
//! One instance of this loop owns the whole lifecycle of a child process.
//! It is the only place allowed to signal, kill or wait on the child or its
//! descendants; the drainers only ever touch stream I/O.
//!
//! Per tick (one timed pop from the line queue) the loop:
//! - consumes output lines, feeding them to the line handler and resetting
//!   the inactivity counter;
//! - counts idle ticks toward the progressive (inactivity) timeout, probing
//!   for an unexpected child exit every 30 idle ticks;
//! - checks the wall clock against the soft deadline, the grace period and
//!   the hard-kill threshold.
//!
//! Whichever condition fires first wins; the common success path is neither
//! firing and both stream sentinels arriving.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Instant;

use tokio::process::Child;
use tokio::time;
use tracing::{debug, warn};

use crate::supervise::ptree::{kill_children, ProcessTree};
use crate::supervise::queue::{LineReceiver, QueueEntry};
use crate::supervise::{DeadlineStatus, ExecutionRequest, RunContext, FATAL_EXIT_CODE};

/// Idle ticks between opportunistic "did the child die on us?" probes.
const LIVENESS_PROBE_TICKS: u64 = 30;

/// What the loop concluded; the supervisor folds this into the
/// `ExecutionResult` after joining the drainers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ControllerOutcome {
    pub timed_out: bool,
    pub deadline: DeadlineStatus,
    pub exit_code: Option<i32>,
    pub matched: bool,
    pub fatal: bool,
}

/// Drive the child to one of the terminal states.
///
/// Every exit path falls through to a final blocking wait (when no exit code
/// was recorded and no timeout fired) and an unconditional sweep of the
/// still-known children. Only the fatal OS-error path returns early, after
/// its own full-tree kill.
pub(crate) async fn run_loop<H>(
    request: &ExecutionRequest,
    child: &mut Child,
    rx: &mut LineReceiver,
    tree: &dyn ProcessTree,
    ctx: &mut RunContext,
    handler: &mut H,
) -> ControllerOutcome
where
    H: FnMut(u64, Option<&QueueEntry>, &mut RunContext) -> bool + Send,
{
    let poll = request.poll_interval;
    let started = Instant::now();
    let deadline_at = request.deadline_instant(started);
    let final_deadline = deadline_at + request.grace_duration();
    let pid = ctx.pid;
    // Sandbox directory used to dig for orphaned descendants once the child
    // itself is gone. Descendants inherit our own working directory when the
    // request does not pin one.
    let sandbox: PathBuf = request
        .working_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut tick: u64 = 0;
    let mut closed_streams: u8 = 0;
    let mut grace_count: u64 = 0;
    // Last known children; recaptured and merged before every kill, but
    // remembered so a dead parent's descendants can still be targeted.
    let mut known_children: Vec<u32> = Vec::new();

    let mut timed_out = false;
    let mut deadline = DeadlineStatus::NotReached;
    let mut exit_code: Option<i32> = None;
    let mut matched = false;

    loop {
        match time::timeout(poll, rx.recv()).await {
            Ok(Some(entry @ QueueEntry::Line { .. })) => {
                tick = 0;
                matched |= handler(0, Some(&entry), ctx);
            }
            Ok(Some(QueueEntry::Closed(source))) => {
                tick = 0;
                closed_streams += 1;
                debug!(
                    identifier = %ctx.identifier,
                    stream = source.label(),
                    "stream drained to end"
                );
                if closed_streams == 2 {
                    // Child released both its pipes; the normal success path.
                    break;
                }
            }
            Ok(Some(QueueEntry::Fatal(err))) => {
                // An unexpected OS-level stream error poisons the whole
                // execution: sweep everything this process spawned, not
                // just the tracked child, and bail out.
                ctx.add_message(
                    format!("{} got an OS error, aborting run: {err}", ctx.identifier),
                    true,
                );
                let mut everything = tree.children_of(std::process::id());
                everything.extend(tree.dig_for_orphans(&sandbox));
                let _ = child.start_kill();
                kill_children(tree, &ctx.identifier, &everything);
                let _ = child.wait().await;
                return ControllerOutcome {
                    timed_out: true,
                    deadline: DeadlineStatus::Expired,
                    exit_code: Some(FATAL_EXIT_CODE),
                    matched: false,
                    fatal: true,
                };
            }
            Ok(None) => {
                // All senders dropped without sentinels; treat as closure.
                debug!(identifier = %ctx.identifier, "line queue closed");
                break;
            }
            Err(_elapsed) => {
                tick += 1;
                let _ = handler(tick, None, ctx);

                if tick >= request.progressive_timeout {
                    ctx.add_message(
                        format!(
                            "{} no output for {tick} ticks, killing process",
                            ctx.identifier
                        ),
                        true,
                    );
                    known_children.extend(tree.children_of(pid));
                    let _ = child.start_kill();
                    kill_children(tree, &ctx.identifier, &known_children);
                    exit_code = wait_for_exit(child, ctx).await;
                    timed_out = true;
                    break;
                }

                if tick % LIVENESS_PROBE_TICKS == 0 {
                    known_children.extend(tree.children_of(pid));
                    match time::timeout(poll, child.wait()).await {
                        Ok(status) => {
                            // The child is gone without having closed both
                            // streams yet.
                            exit_code = status.ok().as_ref().map(exit_code_of);
                            known_children.extend(tree.dig_for_orphans(&sandbox));
                            ctx.add_message(
                                format!(
                                    "{} exited unexpectedly: {exit_code:?}",
                                    ctx.identifier
                                ),
                                true,
                            );
                            kill_children(tree, &ctx.identifier, &known_children);
                            break;
                        }
                        Err(_) => {} // still alive, all is well
                    }
                }
            }
        }

        // Deadline tiers, evaluated independently every iteration.
        let now = Instant::now();
        if now > deadline_at {
            match deadline {
                DeadlineStatus::NotReached => {
                    deadline = DeadlineStatus::SignalSent;
                    ctx.add_message(
                        format!(
                            "{} execution deadline reached, sending {}",
                            ctx.identifier, request.signal
                        ),
                        false,
                    );
                    known_children.extend(tree.children_of(pid));
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            exit_code = Some(exit_code_of(&status));
                            known_children.extend(tree.dig_for_orphans(&sandbox));
                            debug!(identifier = %ctx.identifier, "process already dead");
                        }
                        Ok(None) => tree.send_signal(pid, request.signal.as_raw()),
                        Err(err) => {
                            warn!(
                                identifier = %ctx.identifier,
                                error = %err,
                                "could not probe process before signalling"
                            );
                            known_children.extend(tree.dig_for_orphans(&sandbox));
                        }
                    }
                }
                DeadlineStatus::SignalSent | DeadlineStatus::Expired
                    if now > final_deadline =>
                {
                    deadline = DeadlineStatus::Expired;
                    debug!(identifier = %ctx.identifier, "grace period, trying wait");
                    known_children.extend(tree.children_of(pid));
                    match time::timeout(poll, child.wait()).await {
                        Ok(status) => {
                            exit_code = status.ok().as_ref().map(exit_code_of);
                            ctx.add_message(
                                format!("{} exited: {exit_code:?}", ctx.identifier),
                                false,
                            );
                            kill_children(tree, &ctx.identifier, &known_children);
                            break;
                        }
                        Err(_) => {
                            grace_count += 1;
                            debug!(
                                identifier = %ctx.identifier,
                                grace_count,
                                "timeout waiting for exit"
                            );
                            // Not willing to go on its own; use force.
                            if grace_count > request.grace_period {
                                known_children.extend(tree.children_of(pid));
                                kill_children(tree, &ctx.identifier, &known_children);
                                ctx.add_message(
                                    format!("{} grace period exhausted, killing", ctx.identifier),
                                    true,
                                );
                                let _ = child.start_kill();
                                exit_code = wait_for_exit(child, ctx).await;
                                break;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    debug!(identifier = %ctx.identifier, "controller loop done");
    if timed_out {
        ctx.add_message(format!("{} timeout occurred", ctx.identifier), true);
    } else if exit_code.is_none() {
        debug!(identifier = %ctx.identifier, "waiting for regular exit");
        exit_code = wait_for_exit(child, ctx).await;
    }

    known_children.extend(tree.children_of(pid));
    kill_children(tree, &ctx.identifier, &known_children);

    ControllerOutcome {
        timed_out,
        deadline,
        exit_code,
        matched,
        fatal: false,
    }
}

async fn wait_for_exit(child: &mut Child, ctx: &RunContext) -> Option<i32> {
    match child.wait().await {
        Ok(status) => Some(exit_code_of(&status)),
        Err(err) => {
            warn!(identifier = %ctx.identifier, error = %err, "wait on child failed");
            None
        }
    }
}

/// Exit code of a finished child; a signal death maps to the negated signal
/// number on Unix, mirroring how process libraries usually report it.
fn exit_code_of(status: &ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|sig| -sig))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}
