//! World simulation collaborator
//!
//! Consumes events emitted by movement sessions. Terrain and collision live
//! elsewhere; this side only tracks where each mobile was last placed.
//! Departures travel on the same channel as moves, so a mobile's last update
//! can never land after it has been removed.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::movement::{MobileId, PositionUpdate};

/// Capacity of the world event channel
pub const WORLD_CHANNEL_CAPACITY: usize = 1024;

/// What a session tells the world simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldEvent {
    Moved(PositionUpdate),
    /// The session ended; nothing more will follow for this mobile
    Left(MobileId),
}

#[derive(Default)]
pub struct WorldState {
    positions: DashMap<MobileId, PositionUpdate>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start consuming events. Returns the sender sessions publish to.
    pub fn spawn(self: &Arc<Self>) -> mpsc::Sender<WorldEvent> {
        let (tx, rx) = mpsc::channel(WORLD_CHANNEL_CAPACITY);
        tokio::spawn(self.clone().run(rx));
        tx
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<WorldEvent>) {
        while let Some(event) = rx.recv().await {
            self.apply(event);
        }
        info!("World event channel closed");
    }

    pub fn apply(&self, event: WorldEvent) {
        match event {
            WorldEvent::Moved(update) => {
                debug!(
                    mobile_id = update.mobile_id,
                    x = update.new_position.x,
                    y = update.new_position.y,
                    z = update.new_position.z,
                    facing = ?update.new_facing,
                    timestamp = update.timestamp,
                    "Position update"
                );
                self.positions.insert(update.mobile_id, update);
            }
            WorldEvent::Left(mobile_id) => {
                debug!(mobile_id, "Mobile left the world");
                self.positions.remove(&mobile_id);
            }
        }
    }

    pub fn last_known(&self, mobile_id: MobileId) -> Option<PositionUpdate> {
        self.positions.get(&mobile_id).map(|p| *p.value())
    }

    pub fn tracked(&self) -> usize {
        self.positions.len()
    }
}
