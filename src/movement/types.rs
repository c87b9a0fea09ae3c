//! Core movement types shared by admission, scheduling and the wire protocol

use serde::{Deserialize, Serialize};

/// Serial identifying a mobile in the world
pub type MobileId = u32;

/// The eight compass directions a mobile can step or face.
///
/// Names follow the client's isometric view: `Right` is north-east,
/// `Down` is south-east, `Left` is south-west and `Up` is north-west.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    North,
    Right,
    East,
    Down,
    South,
    Left,
    West,
    Up,
}

impl Direction {
    /// Tile offset `(dx, dy)` of a single step. `y` grows southwards.
    pub fn offset(self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::Right => (1, -1),
            Direction::East => (1, 0),
            Direction::Down => (1, 1),
            Direction::South => (0, 1),
            Direction::Left => (-1, 1),
            Direction::West => (-1, 0),
            Direction::Up => (-1, -1),
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::South
    }
}

/// Tile coordinates of a mobile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: u16,
    pub y: u16,
    pub z: i8,
}

impl Position {
    pub fn new(x: u16, y: u16, z: i8) -> Self {
        Self { x, y, z }
    }

    /// Position one tile away in `direction`, clamped to the map bounds
    pub fn step(self, direction: Direction) -> Self {
        let (dx, dy) = direction.offset();
        Self {
            x: (self.x as i32 + dx).clamp(0, u16::MAX as i32) as u16,
            y: (self.y as i32 + dy).clamp(0, u16::MAX as i32) as u16,
            z: self.z,
        }
    }
}

/// A single movement request as submitted by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementCommand {
    pub direction: Direction,
    #[serde(default)]
    pub running: bool,
    /// Client step counter, checked when present
    #[serde(default)]
    pub sequence: Option<u8>,
    /// Fastwalk ticket, only meaningful under ticket-based admission
    #[serde(default)]
    pub ticket_id: Option<u32>,
}

impl MovementCommand {
    /// Displacement in tiles this command produces once executed
    pub fn displacement_tiles(&self) -> f64 {
        1.0
    }
}

/// Command builders for tests
#[cfg(test)]
impl MovementCommand {
    pub fn walk(direction: Direction) -> Self {
        Self {
            direction,
            running: false,
            sequence: None,
            ticket_id: None,
        }
    }

    pub fn run(direction: Direction) -> Self {
        Self {
            running: true,
            ..Self::walk(direction)
        }
    }

    pub fn with_ticket(mut self, ticket_id: u32) -> Self {
        self.ticket_id = Some(ticket_id);
        self
    }

    pub fn with_sequence(mut self, sequence: u8) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Per-mobile walking speed, supplied by the world simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedProfile {
    /// Time to walk one tile
    pub base_tile_duration_ms: u64,
}

impl SpeedProfile {
    pub fn new(base_tile_duration_ms: u64) -> Self {
        Self {
            base_tile_duration_ms,
        }
    }
}

/// Outbound event consumed by the world simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub mobile_id: MobileId,
    pub new_position: Position,
    pub new_facing: Direction,
    /// Server clock milliseconds at which the step logically completed
    pub timestamp: u64,
}

/// Why a movement command was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("ticket is not outstanding for this session")]
    UnknownTicket,

    #[error("ticket presented ahead of an older outstanding ticket")]
    OutOfOrderTicket,

    #[error("no movement tickets available")]
    NoTicketsAvailable,

    #[error("movement queue is full")]
    QueueFull,

    #[error("movement exceeds the distance allowed over the window")]
    ExcessiveSpeed,

    #[error("movement sequence number out of step")]
    SequenceMismatch,

    #[error("mobile has not entered the world")]
    NotInWorld,

    #[error("movement session has ended")]
    SessionClosed,
}

impl RejectReason {
    /// Protocol violations are cheat signals; everything else is backpressure.
    pub fn is_violation(self) -> bool {
        matches!(
            self,
            RejectReason::UnknownTicket
                | RejectReason::OutOfOrderTicket
                | RejectReason::SequenceMismatch
        )
    }

    /// Stable wire code
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::UnknownTicket => "unknown_ticket",
            RejectReason::OutOfOrderTicket => "out_of_order_ticket",
            RejectReason::NoTicketsAvailable => "no_tickets_available",
            RejectReason::QueueFull => "queue_full",
            RejectReason::ExcessiveSpeed => "excessive_speed",
            RejectReason::SequenceMismatch => "sequence_mismatch",
            RejectReason::NotInWorld => "not_in_world",
            RejectReason::SessionClosed => "session_closed",
        }
    }
}

/// Advance a client step counter. Zero is only used for the first step,
/// so the counter wraps from 255 back to 1.
pub fn next_sequence(sequence: u8) -> u8 {
    if sequence == u8::MAX {
        1
    } else {
        sequence + 1
    }
}
