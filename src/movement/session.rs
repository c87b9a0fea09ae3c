//! Per-connection movement aggregate
//!
//! `MovementSession` is plain synchronous state driven with explicit
//! millisecond timestamps. The actor in [`super::actor`] owns one and feeds it
//! client commands and timer events from a single mailbox.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::policy::{build_policy, PolicySnapshot, RateLimitConfig, RateLimitPolicy};
use super::scheduler::{Completion, MobileMovementState, MovementScheduler, SchedulerState};
use super::types::{
    next_sequence, Direction, MobileId, MovementCommand, Position, RejectReason, SpeedProfile,
};

/// Timing of an admitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub sequence: Option<u8>,
    pub scheduled_start: u64,
    pub scheduled_completion: u64,
}

/// Point-in-time view of a session for operators and the world collaborator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub mobile_id: MobileId,
    pub position: Position,
    pub facing: Direction,
    pub in_world: bool,
    pub base_tile_duration_ms: u64,
    pub scheduler: SchedulerState,
    pub queued: usize,
    pub expected_sequence: u8,
    pub violations: u32,
    pub policy: PolicySnapshot,
}

pub struct MovementSession {
    state: MobileMovementState,
    policy: Box<dyn RateLimitPolicy>,
    scheduler: MovementScheduler,
    expected_sequence: u8,
    violations: u32,
    in_world: bool,
    stall_grace_ms: u64,
}

impl MovementSession {
    pub fn new(
        mobile_id: MobileId,
        config: &RateLimitConfig,
        speed: SpeedProfile,
        position: Position,
        facing: Direction,
    ) -> Self {
        let state = MobileMovementState::new(
            mobile_id,
            position,
            facing,
            speed,
            config.run_speed_multiplier,
        );
        Self::with_policy(state, build_policy(config), config.stall_grace_ms)
    }

    pub fn with_policy(
        state: MobileMovementState,
        policy: Box<dyn RateLimitPolicy>,
        stall_grace_ms: u64,
    ) -> Self {
        Self {
            state,
            policy,
            scheduler: MovementScheduler::new(),
            expected_sequence: 0,
            violations: 0,
            in_world: false,
            stall_grace_ms,
        }
    }

    /// Enter the world. Returns the initial ticket batch, empty when the
    /// policy does not use tickets or the mobile is already in the world.
    pub fn on_world_entry(&mut self, now: u64) -> Vec<u32> {
        if self.in_world {
            warn!(mobile_id = self.mobile_id(), "Duplicate world entry ignored");
            return Vec::new();
        }
        self.in_world = true;
        self.expected_sequence = 0;

        let tickets = self.policy.on_world_entry(now);
        info!(
            mobile_id = self.mobile_id(),
            policy = %self.policy.kind(),
            tickets = tickets.len(),
            "Mobile entered world"
        );
        tickets
    }

    /// Admit and schedule a command, or say why not
    pub fn submit(&mut self, command: MovementCommand, now: u64) -> Result<Scheduled, RejectReason> {
        match self.admit(&command, now) {
            Ok(()) => {
                let queued = self.scheduler.schedule(&mut self.state, command, now);
                if let Some(sequence) = command.sequence {
                    self.expected_sequence = next_sequence(sequence);
                }
                Ok(Scheduled {
                    sequence: command.sequence,
                    scheduled_start: queued.scheduled_start,
                    scheduled_completion: queued.scheduled_completion,
                })
            }
            Err(reason) if reason.is_violation() => {
                self.violations += 1;
                warn!(
                    mobile_id = self.mobile_id(),
                    reason = reason.code(),
                    ticket = ?command.ticket_id,
                    sequence = ?command.sequence,
                    violations = self.violations,
                    "Movement protocol violation"
                );
                Err(reason)
            }
            Err(reason) => {
                debug!(
                    mobile_id = self.mobile_id(),
                    reason = reason.code(),
                    queued = self.scheduler.len(),
                    "Movement deferred"
                );
                Err(reason)
            }
        }
    }

    fn admit(&mut self, command: &MovementCommand, now: u64) -> Result<(), RejectReason> {
        if !self.in_world {
            return Err(RejectReason::NotInWorld);
        }
        if let Some(sequence) = command.sequence {
            if sequence != self.expected_sequence {
                return Err(RejectReason::SequenceMismatch);
            }
        }
        self.policy.accept(&self.state, command, now)
    }

    /// Timer callback: execute every step due by `now`
    pub fn on_timer(&mut self, now: u64) -> Vec<Completion> {
        self.scheduler
            .complete_due(&mut self.state, self.policy.as_mut(), now)
    }

    /// Watchdog pass: force the oldest step through if its timer never fired
    pub fn reconcile(&mut self, now: u64) -> Option<Completion> {
        if !self.scheduler.is_stalled(now, self.stall_grace_ms) {
            return None;
        }
        self.scheduler
            .force_complete_oldest(&mut self.state, self.policy.as_mut())
    }

    /// External teleport or recall
    pub fn teleport(&mut self, position: Position, facing: Direction) {
        self.state.position = position;
        self.state.facing = facing;
        self.expected_sequence = 0;
        self.policy.on_teleport();
        info!(
            mobile_id = self.mobile_id(),
            x = position.x,
            y = position.y,
            "Mobile teleported"
        );
    }

    /// Applies to commands scheduled from now on
    pub fn set_speed(&mut self, speed: SpeedProfile) {
        self.state.base_tile_duration_ms = speed.base_tile_duration_ms;
    }

    /// Tear down: drop queued steps. Executed steps stay applied.
    pub fn on_disconnect(&mut self) -> usize {
        let dropped = self.scheduler.cancel_all();
        self.in_world = false;
        info!(
            mobile_id = self.mobile_id(),
            dropped_movements = dropped,
            violations = self.violations,
            "Movement session closed"
        );
        dropped
    }

    pub fn mobile_id(&self) -> MobileId {
        self.state.mobile_id
    }

    pub fn state(&self) -> &MobileMovementState {
        &self.state
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    pub fn expected_sequence(&self) -> u8 {
        self.expected_sequence
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.scheduler.next_deadline()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn queued(&self) -> usize {
        self.scheduler.len()
    }

    pub fn policy(&self) -> PolicySnapshot {
        self.policy.snapshot()
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            mobile_id: self.mobile_id(),
            position: self.state.position,
            facing: self.state.facing,
            in_world: self.in_world,
            base_tile_duration_ms: self.state.base_tile_duration_ms,
            scheduler: self.scheduler_state(),
            queued: self.queued(),
            expected_sequence: self.expected_sequence(),
            violations: self.violations(),
            policy: self.policy(),
        }
    }
}
