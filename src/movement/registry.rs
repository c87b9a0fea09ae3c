//! Registry of live movement sessions

use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tracing::info;

use super::actor::{SessionActor, SessionContext, SessionEvent, SessionHandle};
use super::policy::PolicyKind;
use super::session::SessionView;
use super::types::{Direction, MobileId, Position, RejectReason, SpeedProfile};

pub struct SessionRegistry {
    sessions: DashMap<MobileId, SessionHandle>,
    next_id: AtomicU32,
    ctx: SessionContext,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        // Random starting serial so mobile ids don't leak server uptime
        let first_id = rand::thread_rng().gen_range(0x0000_1000..0x0010_0000);
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU32::new(first_id),
            ctx,
        }
    }

    /// Allocate a mobile and start its session actor
    pub fn open(
        &self,
        speed: SpeedProfile,
        position: Position,
        facing: Direction,
    ) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
        let mobile_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, events) = SessionActor::spawn(mobile_id, speed, position, facing, self.ctx.clone());
        self.sessions.insert(mobile_id, handle.clone());

        info!(mobile_id, active_sessions = self.sessions.len(), "Movement session opened");
        (handle, events)
    }

    pub fn get(&self, mobile_id: MobileId) -> Option<SessionHandle> {
        self.sessions.get(&mobile_id).map(|h| h.value().clone())
    }

    /// Move a mobile outside the normal step flow (recall, gate travel)
    pub async fn teleport(
        &self,
        mobile_id: MobileId,
        position: Position,
        facing: Direction,
    ) -> Result<(), RejectReason> {
        self.handle(mobile_id)?.teleport(position, facing).await
    }

    /// Change a mobile's walking speed, e.g. on mounting or dismounting
    pub async fn set_speed(&self, mobile_id: MobileId, speed: SpeedProfile) -> Result<(), RejectReason> {
        self.handle(mobile_id)?.set_speed(speed).await
    }

    pub async fn inspect(&self, mobile_id: MobileId) -> Result<SessionView, RejectReason> {
        self.handle(mobile_id)?.inspect().await
    }

    fn handle(&self, mobile_id: MobileId) -> Result<SessionHandle, RejectReason> {
        self.get(mobile_id).ok_or(RejectReason::SessionClosed)
    }

    /// Stop a session and forget it
    pub async fn close(&self, mobile_id: MobileId) {
        if let Some((_, handle)) = self.sessions.remove(&mobile_id) {
            handle.disconnect().await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn policy(&self) -> PolicyKind {
        self.ctx.config.policy
    }
}
