//! Serialized per-mobile movement scheduling
//!
//! Steps never overlap: each admitted command starts no earlier than the
//! completion of the one before it, so a client that submits ahead of time is
//! queued rather than sped up. Completions are drained strictly in FIFO
//! order, which keeps completion timestamps non-decreasing even when the
//! timer fires late.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, warn};

use super::policy::RateLimitPolicy;
use super::types::{Direction, MobileId, MovementCommand, Position, PositionUpdate, SpeedProfile};

/// Authoritative movement state for one mobile
#[derive(Debug, Clone, PartialEq)]
pub struct MobileMovementState {
    pub mobile_id: MobileId,
    pub position: Position,
    pub facing: Direction,
    pub last_scheduled_completion: u64,
    pub base_tile_duration_ms: u64,
    pub run_speed_multiplier: f64,
}

impl MobileMovementState {
    pub fn new(
        mobile_id: MobileId,
        position: Position,
        facing: Direction,
        speed: SpeedProfile,
        run_speed_multiplier: f64,
    ) -> Self {
        Self {
            mobile_id,
            position,
            facing,
            last_scheduled_completion: 0,
            base_tile_duration_ms: speed.base_tile_duration_ms,
            run_speed_multiplier,
        }
    }

    /// Time to cover one tile at the current speed
    pub fn tile_duration_ms(&self, running: bool) -> u64 {
        if running && self.run_speed_multiplier > 0.0 {
            (self.base_tile_duration_ms as f64 / self.run_speed_multiplier).round() as u64
        } else {
            self.base_tile_duration_ms
        }
    }
}

/// An admitted command waiting for its completion time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedMovement {
    pub command: MovementCommand,
    pub scheduled_start: u64,
    pub scheduled_completion: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Scheduled,
}

/// Result of executing one queued step
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub movement: QueuedMovement,
    pub update: PositionUpdate,
    /// Tickets issued because this step freed capacity
    pub replenished: Vec<u32>,
    /// Set when the watchdog pushed the step through instead of its timer
    pub forced: bool,
}

#[derive(Debug, Default)]
pub struct MovementScheduler {
    pending: VecDeque<QueuedMovement>,
}

impl MovementScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an admitted command behind everything already scheduled
    pub fn schedule(
        &mut self,
        mobile: &mut MobileMovementState,
        command: MovementCommand,
        now: u64,
    ) -> QueuedMovement {
        let scheduled_start = now.max(mobile.last_scheduled_completion);
        let duration = mobile.tile_duration_ms(command.running);
        let scheduled_completion = scheduled_start + duration;
        mobile.last_scheduled_completion = scheduled_completion;

        let movement = QueuedMovement {
            command,
            scheduled_start,
            scheduled_completion,
        };
        self.pending.push_back(movement);

        debug!(
            mobile_id = mobile.mobile_id,
            scheduled_start,
            scheduled_completion,
            queued = self.pending.len(),
            "Movement scheduled"
        );

        movement
    }

    pub fn state(&self) -> SchedulerState {
        if self.pending.is_empty() {
            SchedulerState::Idle
        } else {
            SchedulerState::Scheduled
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Completion time of the oldest queued step
    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.front().map(|m| m.scheduled_completion)
    }

    /// Execute every step whose completion time has been reached, in order
    pub fn complete_due(
        &mut self,
        mobile: &mut MobileMovementState,
        policy: &mut dyn RateLimitPolicy,
        now: u64,
    ) -> Vec<Completion> {
        let mut completions = Vec::new();
        while self
            .pending
            .front()
            .is_some_and(|m| m.scheduled_completion <= now)
        {
            if let Some(movement) = self.pending.pop_front() {
                completions.push(Self::complete(movement, mobile, policy, false));
            }
        }
        completions
    }

    /// Whether the oldest step has overrun its completion by more than `grace_ms`
    pub fn is_stalled(&self, now: u64, grace_ms: u64) -> bool {
        self.pending
            .front()
            .is_some_and(|m| now >= m.scheduled_completion.saturating_add(grace_ms))
    }

    /// Push the oldest step through regardless of its timer
    pub fn force_complete_oldest(
        &mut self,
        mobile: &mut MobileMovementState,
        policy: &mut dyn RateLimitPolicy,
    ) -> Option<Completion> {
        let movement = self.pending.pop_front()?;
        warn!(
            mobile_id = mobile.mobile_id,
            scheduled_completion = movement.scheduled_completion,
            "Movement completion overdue, forcing"
        );
        Some(Self::complete(movement, mobile, policy, true))
    }

    /// Drop all queued steps. Returns how many were discarded.
    pub fn cancel_all(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    fn complete(
        movement: QueuedMovement,
        mobile: &mut MobileMovementState,
        policy: &mut dyn RateLimitPolicy,
        forced: bool,
    ) -> Completion {
        let direction = movement.command.direction;
        mobile.position = mobile.position.step(direction);
        mobile.facing = direction;

        let update = PositionUpdate {
            mobile_id: mobile.mobile_id,
            new_position: mobile.position,
            new_facing: mobile.facing,
            timestamp: movement.scheduled_completion,
        };

        let replenished = policy.on_complete(mobile, &movement.command, movement.scheduled_completion);

        Completion {
            movement,
            update,
            replenished,
            forced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::policy::QueueDepthBased;
    use crate::movement::types::RejectReason;

    fn mobile() -> MobileMovementState {
        MobileMovementState::new(7, Position::new(100, 100, 0), Direction::South, SpeedProfile::new(400), 2.0)
    }

    #[test]
    fn test_running_halves_tile_duration() {
        let mobile = mobile();
        assert_eq!(mobile.tile_duration_ms(false), 400);
        assert_eq!(mobile.tile_duration_ms(true), 200);
    }

    #[test]
    fn test_schedule_serializes_early_commands() {
        let mut mobile = mobile();
        let mut scheduler = MovementScheduler::new();

        let a = scheduler.schedule(&mut mobile, MovementCommand::walk(Direction::North), 0);
        let b = scheduler.schedule(&mut mobile, MovementCommand::run(Direction::North), 10);
        let c = scheduler.schedule(&mut mobile, MovementCommand::walk(Direction::North), 20);

        assert_eq!((a.scheduled_start, a.scheduled_completion), (0, 400));
        assert_eq!((b.scheduled_start, b.scheduled_completion), (400, 600));
        assert_eq!((c.scheduled_start, c.scheduled_completion), (600, 1000));
        assert_eq!(mobile.last_scheduled_completion, 1000);
        assert_eq!(scheduler.state(), SchedulerState::Scheduled);
    }

    #[test]
    fn test_schedule_after_idle_starts_now() {
        let mut mobile = mobile();
        let mut scheduler = MovementScheduler::new();
        scheduler.schedule(&mut mobile, MovementCommand::walk(Direction::East), 0);

        let later = scheduler.schedule(&mut mobile, MovementCommand::walk(Direction::East), 5000);
        assert_eq!(later.scheduled_start, 5000);
    }

    #[test]
    fn test_complete_due_applies_steps_in_order() {
        let mut mobile = mobile();
        let mut policy = QueueDepthBased::new(6);
        let mut scheduler = MovementScheduler::new();

        for dir in [Direction::North, Direction::East, Direction::South] {
            policy.accept(&mobile, &MovementCommand::walk(dir), 0).unwrap();
            scheduler.schedule(&mut mobile, MovementCommand::walk(dir), 0);
        }

        assert!(scheduler.complete_due(&mut mobile, &mut policy, 399).is_empty());

        // A late timer drains everything that is due, oldest first
        let done = scheduler.complete_due(&mut mobile, &mut policy, 850);
        let stamps: Vec<u64> = done.iter().map(|c| c.update.timestamp).collect();
        assert_eq!(stamps, vec![400, 800]);
        assert_eq!(mobile.position, Position::new(101, 99, 0));
        assert_eq!(mobile.facing, Direction::East);
        assert_eq!(policy.snapshot().queue_depth, Some(1));
        assert_eq!(scheduler.next_deadline(), Some(1200));
    }

    #[test]
    fn test_stall_forces_oldest_only() {
        let mut mobile = mobile();
        let mut policy = QueueDepthBased::new(1);
        let mut scheduler = MovementScheduler::new();

        policy.accept(&mobile, &MovementCommand::walk(Direction::West), 0).unwrap();
        scheduler.schedule(&mut mobile, MovementCommand::walk(Direction::West), 0);
        assert_eq!(
            policy.accept(&mobile, &MovementCommand::walk(Direction::West), 0),
            Err(RejectReason::QueueFull)
        );

        assert!(!scheduler.is_stalled(1399, 1000));
        assert!(scheduler.is_stalled(1400, 1000));

        let forced = scheduler.force_complete_oldest(&mut mobile, &mut policy).unwrap();
        assert!(forced.forced);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(policy.snapshot().queue_depth, Some(0));
    }

    #[test]
    fn test_cancel_all_returns_to_idle() {
        let mut mobile = mobile();
        let mut scheduler = MovementScheduler::new();
        scheduler.schedule(&mut mobile, MovementCommand::walk(Direction::Up), 0);
        scheduler.schedule(&mut mobile, MovementCommand::walk(Direction::Up), 0);

        assert_eq!(scheduler.cancel_all(), 2);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(scheduler.next_deadline(), None);
        // Cancelled steps never move the mobile
        assert_eq!(mobile.position, Position::new(100, 100, 0));
    }
}
