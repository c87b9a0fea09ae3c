//! Movement admission and scheduling

pub mod actor;
pub mod distance;
pub mod policy;
pub mod queue_depth;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod ticket;
pub mod timer;
pub mod types;

pub use actor::{Rejection, SessionContext, SessionEvent, SessionHandle};
pub use policy::{PolicyKind, RateLimitConfig};
pub use registry::SessionRegistry;
pub use session::{Scheduled, SessionView};
pub use timer::TimerDispatcher;
pub use types::{Direction, MobileId, MovementCommand, Position, PositionUpdate, RejectReason, SpeedProfile};
