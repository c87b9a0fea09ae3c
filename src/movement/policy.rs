//! Pluggable movement rate-limit policies
//!
//! The session and scheduler only ever talk to [`RateLimitPolicy`]; which
//! variant is in effect is decided once from configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

use crate::config::ConfigError;

use super::distance::DistanceWindow;
use super::queue_depth::QueueDepthTracker;
use super::scheduler::MobileMovementState;
use super::ticket::{TicketBuffer, TicketIssuer, TicketValidator};
use super::types::{MovementCommand, RejectReason};

/// Which admission scheme the server runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    TicketBased,
    QueueDepthBased,
    DistanceIntegration,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyKind::TicketBased => "ticket_based",
            PolicyKind::QueueDepthBased => "queue_depth_based",
            PolicyKind::DistanceIntegration => "distance_integration",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "ticketbased" | "ticket" | "fastwalk" => Ok(PolicyKind::TicketBased),
            "queuedepthbased" | "queuedepth" => Ok(PolicyKind::QueueDepthBased),
            "distanceintegration" | "distance" => Ok(PolicyKind::DistanceIntegration),
            _ => Err(ConfigError::Invalid {
                var: "MOVEMENT_POLICY",
                value: s.to_string(),
            }),
        }
    }
}

/// Movement admission settings shared by every session
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub policy: PolicyKind,
    pub ticket_buffer_size: usize,
    pub queue_depth_limit: usize,
    pub distance_window_ms: u64,
    pub distance_limit_tiles: f64,
    pub run_speed_multiplier: f64,
    /// Slack past a step's completion before the watchdog forces it through
    pub stall_grace_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::TicketBased,
            ticket_buffer_size: 6,
            queue_depth_limit: 6,
            distance_window_ms: 1000,
            distance_limit_tiles: 6.0,
            run_speed_multiplier: 2.0,
            stall_grace_ms: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticket_buffer_size == 0 || self.ticket_buffer_size > u8::MAX as usize {
            return Err(ConfigError::OutOfRange("TICKET_BUFFER_SIZE"));
        }
        if self.queue_depth_limit == 0 {
            return Err(ConfigError::OutOfRange("QUEUE_DEPTH_LIMIT"));
        }
        if self.distance_window_ms == 0 {
            return Err(ConfigError::OutOfRange("DISTANCE_WINDOW_MS"));
        }
        if !(self.distance_limit_tiles > 0.0) {
            return Err(ConfigError::OutOfRange("DISTANCE_LIMIT_TILES"));
        }
        if !(self.run_speed_multiplier > 0.0) || !self.run_speed_multiplier.is_finite() {
            return Err(ConfigError::OutOfRange("RUN_SPEED_MULTIPLIER"));
        }
        Ok(())
    }
}

/// Read-only view of a policy's bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicySnapshot {
    pub kind: PolicyKind,
    pub outstanding_tickets: Vec<u32>,
    pub queue_depth: Option<usize>,
    /// Admitted displacement not yet executed
    pub in_flight_tiles: Option<f64>,
}

/// Admission contract every policy implements
pub trait RateLimitPolicy: Send + Sync {
    fn kind(&self) -> PolicyKind;

    /// Called once when the mobile enters the world. Returns tickets to send.
    fn on_world_entry(&mut self, _now: u64) -> Vec<u32> {
        Vec::new()
    }

    /// Decide whether `command` may be scheduled
    fn accept(
        &mut self,
        mobile: &MobileMovementState,
        command: &MovementCommand,
        now: u64,
    ) -> Result<(), RejectReason>;

    /// Called when an admitted command finishes. Returns tickets to send.
    fn on_complete(
        &mut self,
        mobile: &MobileMovementState,
        command: &MovementCommand,
        now: u64,
    ) -> Vec<u32>;

    /// External teleport or recall
    fn on_teleport(&mut self) {}

    fn snapshot(&self) -> PolicySnapshot;
}

/// Ticket possession is the sole gate
pub struct TicketBased {
    buffer: TicketBuffer,
    issuer: TicketIssuer,
}

impl TicketBased {
    pub fn new(buffer_size: usize) -> Self {
        Self::with_issuer(buffer_size, TicketIssuer::new())
    }

    pub fn with_issuer(buffer_size: usize, issuer: TicketIssuer) -> Self {
        Self {
            buffer: TicketBuffer::new(buffer_size),
            issuer,
        }
    }
}

impl RateLimitPolicy for TicketBased {
    fn kind(&self) -> PolicyKind {
        PolicyKind::TicketBased
    }

    fn on_world_entry(&mut self, now: u64) -> Vec<u32> {
        self.issuer.issue_initial_batch(&mut self.buffer, now)
    }

    fn accept(
        &mut self,
        _mobile: &MobileMovementState,
        command: &MovementCommand,
        now: u64,
    ) -> Result<(), RejectReason> {
        let ticket = TicketValidator::validate(&mut self.buffer, &mut self.issuer, command.ticket_id)?;
        trace!(ticket_id = ticket.id, held_ms = now.saturating_sub(ticket.issued_at), "Ticket consumed");
        Ok(())
    }

    fn on_complete(
        &mut self,
        _mobile: &MobileMovementState,
        _command: &MovementCommand,
        now: u64,
    ) -> Vec<u32> {
        self.issuer
            .replenish(&mut self.buffer, now)
            .into_iter()
            .collect()
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            kind: self.kind(),
            outstanding_tickets: self.buffer.ids(),
            queue_depth: None,
            in_flight_tiles: None,
        }
    }
}

/// Bounds the number of in-flight commands
pub struct QueueDepthBased {
    tracker: QueueDepthTracker,
}

impl QueueDepthBased {
    pub fn new(limit: usize) -> Self {
        Self {
            tracker: QueueDepthTracker::new(limit),
        }
    }
}

impl RateLimitPolicy for QueueDepthBased {
    fn kind(&self) -> PolicyKind {
        PolicyKind::QueueDepthBased
    }

    fn accept(
        &mut self,
        _mobile: &MobileMovementState,
        _command: &MovementCommand,
        _now: u64,
    ) -> Result<(), RejectReason> {
        if self.tracker.try_reserve() {
            Ok(())
        } else {
            Err(RejectReason::QueueFull)
        }
    }

    fn on_complete(
        &mut self,
        _mobile: &MobileMovementState,
        _command: &MovementCommand,
        _now: u64,
    ) -> Vec<u32> {
        self.tracker.release();
        Vec::new()
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            kind: self.kind(),
            outstanding_tickets: Vec::new(),
            queue_depth: Some(self.tracker.depth()),
            in_flight_tiles: None,
        }
    }
}

/// Caps displacement over a trailing time window.
///
/// The window holds executed steps, stamped with their completion time.
/// Admitted steps that have not executed yet are carried separately and
/// count against the limit too, so submitting ahead of the walking pace
/// cannot grow the queue past `limit_tiles` steps.
pub struct DistanceIntegration {
    window: DistanceWindow,
    in_flight: f64,
}

impl DistanceIntegration {
    pub fn new(window_ms: u64, limit_tiles: f64) -> Self {
        Self {
            window: DistanceWindow::new(window_ms, limit_tiles),
            in_flight: 0.0,
        }
    }
}

impl RateLimitPolicy for DistanceIntegration {
    fn kind(&self) -> PolicyKind {
        PolicyKind::DistanceIntegration
    }

    fn accept(
        &mut self,
        _mobile: &MobileMovementState,
        command: &MovementCommand,
        now: u64,
    ) -> Result<(), RejectReason> {
        let tiles = command.displacement_tiles();
        if !self.window.admits(now, self.in_flight + tiles) {
            return Err(RejectReason::ExcessiveSpeed);
        }
        self.in_flight += tiles;
        Ok(())
    }

    fn on_complete(
        &mut self,
        _mobile: &MobileMovementState,
        command: &MovementCommand,
        now: u64,
    ) -> Vec<u32> {
        let tiles = command.displacement_tiles();
        self.in_flight = (self.in_flight - tiles).max(0.0);
        self.window.record(now, tiles);
        Vec::new()
    }

    /// Executed history is forgiven; steps still queued keep counting.
    fn on_teleport(&mut self) {
        self.window.reset();
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            kind: self.kind(),
            outstanding_tickets: Vec::new(),
            queue_depth: None,
            in_flight_tiles: Some(self.in_flight),
        }
    }
}

/// Build the configured policy for a new session
pub fn build_policy(config: &RateLimitConfig) -> Box<dyn RateLimitPolicy> {
    match config.policy {
        PolicyKind::TicketBased => Box::new(TicketBased::new(config.ticket_buffer_size)),
        PolicyKind::QueueDepthBased => Box::new(QueueDepthBased::new(config.queue_depth_limit)),
        PolicyKind::DistanceIntegration => Box::new(DistanceIntegration::new(
            config.distance_window_ms,
            config.distance_limit_tiles,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::types::{Direction, Position, SpeedProfile};

    fn mobile() -> MobileMovementState {
        MobileMovementState::new(1, Position::new(10, 10, 0), Direction::South, SpeedProfile::new(400), 2.0)
    }

    #[test]
    fn test_policy_kind_parsing() {
        assert_eq!("ticket_based".parse::<PolicyKind>().unwrap(), PolicyKind::TicketBased);
        assert_eq!("TicketBased".parse::<PolicyKind>().unwrap(), PolicyKind::TicketBased);
        assert_eq!("queue-depth-based".parse::<PolicyKind>().unwrap(), PolicyKind::QueueDepthBased);
        assert_eq!(" DistanceIntegration ".parse::<PolicyKind>().unwrap(), PolicyKind::DistanceIntegration);
        assert!("warp".parse::<PolicyKind>().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(RateLimitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_sizes() {
        let config = RateLimitConfig {
            ticket_buffer_size: 0,
            ..RateLimitConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange("TICKET_BUFFER_SIZE"))));

        let config = RateLimitConfig {
            run_speed_multiplier: 0.0,
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ticket_based_ignores_queue_depth() {
        let mobile = mobile();
        let mut policy = TicketBased::new(8);
        let tickets = policy.on_world_entry(0);

        // Far more in flight than any queue limit would allow
        for id in tickets {
            let cmd = MovementCommand::walk(Direction::North).with_ticket(id);
            assert_eq!(policy.accept(&mobile, &cmd, 0), Ok(()));
        }
        assert!(policy.snapshot().outstanding_tickets.is_empty());
    }

    #[test]
    fn test_ticket_based_replenishes_on_completion() {
        let mobile = mobile();
        let mut policy = TicketBased::new(2);
        let tickets = policy.on_world_entry(0);
        let cmd = MovementCommand::walk(Direction::East).with_ticket(tickets[0]);

        policy.accept(&mobile, &cmd, 0).unwrap();
        assert_eq!(policy.snapshot().outstanding_tickets.len(), 1);

        let fresh = policy.on_complete(&mobile, &cmd, 400);
        assert_eq!(fresh.len(), 1);
        assert_eq!(policy.snapshot().outstanding_tickets, vec![tickets[1], fresh[0]]);
    }

    #[test]
    fn test_queue_depth_ignores_tickets() {
        let mobile = mobile();
        let mut policy = QueueDepthBased::new(2);
        let cmd = MovementCommand::walk(Direction::West).with_ticket(0xdead_beef);

        assert_eq!(policy.accept(&mobile, &cmd, 0), Ok(()));
        assert_eq!(policy.accept(&mobile, &MovementCommand::walk(Direction::West), 0), Ok(()));
        assert_eq!(policy.accept(&mobile, &cmd, 0), Err(RejectReason::QueueFull));
        assert!(policy.on_world_entry(0).is_empty());

        policy.on_complete(&mobile, &cmd, 400);
        assert_eq!(policy.snapshot().queue_depth, Some(1));
    }

    #[test]
    fn test_distance_integration_counts_queued_steps() {
        let mobile = mobile();
        let mut policy = DistanceIntegration::new(1000, 2.0);
        let cmd = MovementCommand::run(Direction::North);

        // Nothing has executed yet, but two admitted steps fill the budget
        policy.accept(&mobile, &cmd, 0).unwrap();
        policy.accept(&mobile, &cmd, 10).unwrap();
        assert_eq!(policy.accept(&mobile, &cmd, 20), Err(RejectReason::ExcessiveSpeed));
        assert_eq!(policy.snapshot().in_flight_tiles, Some(2.0));

        // Executed steps stay in the window until it slides past them
        policy.on_complete(&mobile, &cmd, 200);
        policy.on_complete(&mobile, &cmd, 400);
        assert_eq!(policy.snapshot().in_flight_tiles, Some(0.0));
        assert_eq!(policy.accept(&mobile, &cmd, 500), Err(RejectReason::ExcessiveSpeed));
        assert_eq!(policy.accept(&mobile, &cmd, 1200), Ok(()));
    }

    #[test]
    fn test_distance_integration_teleport_resets_window() {
        let mobile = mobile();
        let mut policy = DistanceIntegration::new(1000, 2.0);
        let cmd = MovementCommand::run(Direction::North);

        policy.accept(&mobile, &cmd, 0).unwrap();
        policy.accept(&mobile, &cmd, 10).unwrap();
        policy.on_complete(&mobile, &cmd, 200);
        policy.on_complete(&mobile, &cmd, 400);
        assert_eq!(policy.accept(&mobile, &cmd, 450), Err(RejectReason::ExcessiveSpeed));

        policy.on_teleport();
        assert_eq!(policy.accept(&mobile, &cmd, 460), Ok(()));
    }

    #[test]
    fn test_build_policy_matches_config() {
        for kind in [
            PolicyKind::TicketBased,
            PolicyKind::QueueDepthBased,
            PolicyKind::DistanceIntegration,
        ] {
            let config = RateLimitConfig {
                policy: kind,
                ..RateLimitConfig::default()
            };
            assert_eq!(build_policy(&config).kind(), kind);
        }
    }
}
