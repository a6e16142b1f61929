//! Pause, step, resume and stop for a single run.
//!
//! The interpreter calls [`RunControl::checkpoint`] before every node starts.
//! A paused run waits there; each `step` lets exactly one waiting checkpoint
//! through, so one node starts per step. Stop releases every waiter and is
//! also checked when an in-flight node returns.

use std::sync::Arc;
use tokio::sync::watch;

/// Requested execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ControlState {
    mode: ControlMode,
    /// Checkpoints a paused run may still pass.
    step_credits: u64,
}

/// Outcome of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Proceed,
    Stopped,
}

/// Shared control channel for one run.
#[derive(Debug, Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<ControlState>>,
}

impl RunControl {
    /// A control that starts running, or paused in step mode.
    pub fn new(step_mode: bool) -> Self {
        let mode = if step_mode {
            ControlMode::Paused
        } else {
            ControlMode::Running
        };
        let (tx, _rx) = watch::channel(ControlState {
            mode,
            step_credits: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn mode(&self) -> ControlMode {
        self.tx.borrow().mode
    }

    pub fn is_stopped(&self) -> bool {
        self.mode() == ControlMode::Stopped
    }

    /// Request a pause at the next checkpoint. Returns false if the run is stopped
    /// or already paused.
    pub fn pause(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if s.mode == ControlMode::Running {
                s.mode = ControlMode::Paused;
                true
            } else {
                false
            }
        })
    }

    /// Leave pause and step mode. Returns false if the run was not paused.
    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if s.mode == ControlMode::Paused {
                s.mode = ControlMode::Running;
                s.step_credits = 0;
                true
            } else {
                false
            }
        })
    }

    /// Let one checkpoint through while paused. Returns false if the run is not paused.
    pub fn step(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if s.mode == ControlMode::Paused {
                s.step_credits += 1;
                true
            } else {
                false
            }
        })
    }

    /// Stop the run. Terminal.
    pub fn stop(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if s.mode == ControlMode::Stopped {
                false
            } else {
                s.mode = ControlMode::Stopped;
                true
            }
        })
    }

    /// Wait at a node boundary until the run may proceed.
    pub async fn checkpoint(&self) -> Checkpoint {
        let mut rx = self.tx.subscribe();
        loop {
            let mut decision = None;
            self.tx.send_if_modified(|s| match s.mode {
                ControlMode::Stopped => {
                    decision = Some(Checkpoint::Stopped);
                    false
                }
                ControlMode::Running => {
                    decision = Some(Checkpoint::Proceed);
                    false
                }
                ControlMode::Paused if s.step_credits > 0 => {
                    s.step_credits -= 1;
                    decision = Some(Checkpoint::Proceed);
                    true
                }
                ControlMode::Paused => false,
            });

            if let Some(decision) = decision {
                return decision;
            }
            if rx.changed().await.is_err() {
                return Checkpoint::Stopped;
            }
        }
    }
}
