//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::movement::{SessionContext, SessionRegistry, TimerDispatcher};
use crate::util::time::ServerClock;
use crate::world::WorldState;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub world: Arc<WorldState>,
}

impl AppState {
    /// Build state and start the shared background tasks. Must be called
    /// from within the tokio runtime.
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let clock = ServerClock::new();

        // Initialize world simulation consumer
        let world = Arc::new(WorldState::new());
        let world_tx = world.spawn();

        // Initialize completion timer dispatch
        let timers = TimerDispatcher::spawn(clock);

        let ctx = SessionContext {
            config: Arc::new(config.movement.clone()),
            timers,
            world_tx,
            clock,
        };
        let registry = Arc::new(SessionRegistry::new(ctx));

        Self {
            config,
            registry,
            world,
        }
    }
}
