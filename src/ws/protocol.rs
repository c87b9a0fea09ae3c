//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};

use crate::movement::{
    Direction, MobileId, MovementCommand, PolicyKind, PositionUpdate, Rejection, RejectReason,
    Scheduled, SessionEvent,
};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Place the mobile in the world and start movement
    EnterWorld,

    /// Step one tile
    Move {
        direction: Direction,
        #[serde(default)]
        running: bool,
        /// Client step counter
        #[serde(default)]
        sequence: Option<u8>,
        /// Fastwalk ticket (ticket-based admission only)
        #[serde(default)]
        ticket_id: Option<u32>,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

impl ClientMsg {
    /// The movement command carried by a `Move` message
    pub fn as_command(&self) -> Option<MovementCommand> {
        match *self {
            ClientMsg::Move {
                direction,
                running,
                sequence,
                ticket_id,
            } => Some(MovementCommand {
                direction,
                running,
                sequence,
                ticket_id,
            }),
            _ => None,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        mobile_id: MobileId,
        server_time: u64,
        policy: PolicyKind,
    },

    /// Fastwalk ticket issuance
    Tickets { ids: Vec<u32> },

    /// Step admitted
    MoveAck {
        sequence: Option<u8>,
        scheduled_start: u64,
        scheduled_completion: u64,
    },

    /// Step refused; client should resync to the given position
    MoveReject {
        sequence: Option<u8>,
        reason: RejectReason,
        x: u16,
        y: u16,
        z: i8,
        facing: Direction,
    },

    /// Step executed
    PositionUpdate {
        mobile_id: MobileId,
        x: u16,
        y: u16,
        z: i8,
        facing: Direction,
        timestamp: u64,
    },

    /// Error message
    Error { code: String, message: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

impl ServerMsg {
    pub fn move_ack(scheduled: &Scheduled) -> Self {
        ServerMsg::MoveAck {
            sequence: scheduled.sequence,
            scheduled_start: scheduled.scheduled_start,
            scheduled_completion: scheduled.scheduled_completion,
        }
    }

    pub fn move_reject(sequence: Option<u8>, rejection: &Rejection) -> Self {
        ServerMsg::MoveReject {
            sequence,
            reason: rejection.reason,
            x: rejection.position.x,
            y: rejection.position.y,
            z: rejection.position.z,
            facing: rejection.facing,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMsg::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<PositionUpdate> for ServerMsg {
    fn from(update: PositionUpdate) -> Self {
        ServerMsg::PositionUpdate {
            mobile_id: update.mobile_id,
            x: update.new_position.x,
            y: update.new_position.y,
            z: update.new_position.z,
            facing: update.new_facing,
            timestamp: update.timestamp,
        }
    }
}

impl From<SessionEvent> for ServerMsg {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Tickets(ids) => ServerMsg::Tickets { ids },
            SessionEvent::Moved(update) => update.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::Position;
    use serde_json::json;

    #[test]
    fn test_move_message_parses() {
        let msg: ClientMsg = serde_json::from_value(json!({
            "type": "move",
            "direction": "up",
            "running": true,
            "sequence": 4,
            "ticket_id": 305419896u32,
        }))
        .unwrap();

        let cmd = msg.as_command().unwrap();
        assert_eq!(cmd.direction, Direction::Up);
        assert!(cmd.running);
        assert_eq!(cmd.sequence, Some(4));
        assert_eq!(cmd.ticket_id, Some(0x1234_5678));
    }

    #[test]
    fn test_minimal_move_message() {
        let msg: ClientMsg = serde_json::from_str(r#"{"type":"move","direction":"west"}"#).unwrap();
        assert_eq!(msg.as_command(), Some(MovementCommand::walk(Direction::West)));
        assert!(ClientMsg::Ping { t: 1 }.as_command().is_none());
    }

    #[test]
    fn test_reject_wire_shape() {
        let rejection = Rejection {
            reason: RejectReason::OutOfOrderTicket,
            position: Position::new(10, 20, -5),
            facing: Direction::Left,
            violations: 3,
        };
        let value = serde_json::to_value(ServerMsg::move_reject(Some(7), &rejection)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "move_reject",
                "sequence": 7,
                "reason": "out_of_order_ticket",
                "x": 10,
                "y": 20,
                "z": -5,
                "facing": "left",
            })
        );
    }

    #[test]
    fn test_session_events_map_to_wire() {
        let tickets: ServerMsg = SessionEvent::Tickets(vec![9, 8]).into();
        assert_eq!(tickets, ServerMsg::Tickets { ids: vec![9, 8] });

        let moved: ServerMsg = SessionEvent::Moved(PositionUpdate {
            mobile_id: 4,
            new_position: Position::new(1, 2, 3),
            new_facing: Direction::Down,
            timestamp: 800,
        })
        .into();
        assert_eq!(
            serde_json::to_value(moved).unwrap()["type"],
            json!("position_update")
        );
    }
}
