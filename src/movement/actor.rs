//! Session actor: one task per connected mobile
//!
//! Client submissions, timer notifications and watchdog passes are all
//! serialized through the actor's mailbox, so a `MovementSession` is never
//! touched from two places at once and no locks are needed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::util::time::ServerClock;
use crate::world::WorldEvent;

use super::policy::RateLimitConfig;
use super::scheduler::Completion;
use super::session::{MovementSession, Scheduled, SessionView};
use super::timer::TimerHandle;
use super::types::{Direction, MobileId, MovementCommand, Position, PositionUpdate, RejectReason, SpeedProfile};

const MAILBOX_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Messages processed by a session actor
pub enum SessionMsg {
    EnterWorld,
    Submit {
        command: MovementCommand,
        reply: oneshot::Sender<Result<Scheduled, Rejection>>,
    },
    Teleport {
        position: Position,
        facing: Direction,
    },
    SetSpeed(SpeedProfile),
    Inspect(oneshot::Sender<SessionView>),
    TimerFired,
    Disconnect,
}

/// Events delivered to the owning connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Ticket issuance, at world entry or on replenishment
    Tickets(Vec<u32>),
    Moved(PositionUpdate),
}

/// A rejected command plus the authoritative state the client should resync to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub position: Position,
    pub facing: Direction,
    pub violations: u32,
}

impl Rejection {
    fn closed() -> Self {
        Self {
            reason: RejectReason::SessionClosed,
            position: Position::default(),
            facing: Direction::default(),
            violations: 0,
        }
    }
}

/// Shared collaborators every session actor needs
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<RateLimitConfig>,
    pub timers: TimerHandle,
    pub world_tx: mpsc::Sender<WorldEvent>,
    pub clock: ServerClock,
}

/// Handle for talking to a running session actor
#[derive(Clone)]
pub struct SessionHandle {
    mobile_id: MobileId,
    tx: mpsc::Sender<SessionMsg>,
}

impl SessionHandle {
    pub fn mobile_id(&self) -> MobileId {
        self.mobile_id
    }

    /// Resolves once the actor has stopped
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub async fn enter_world(&self) -> Result<(), RejectReason> {
        self.send(SessionMsg::EnterWorld).await
    }

    pub async fn submit(&self, command: MovementCommand) -> Result<Scheduled, Rejection> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionMsg::Submit { command, reply })
            .await
            .map_err(|_| Rejection::closed())?;
        rx.await.map_err(|_| Rejection::closed())?
    }

    pub async fn teleport(&self, position: Position, facing: Direction) -> Result<(), RejectReason> {
        self.send(SessionMsg::Teleport { position, facing }).await
    }

    pub async fn set_speed(&self, speed: SpeedProfile) -> Result<(), RejectReason> {
        self.send(SessionMsg::SetSpeed(speed)).await
    }

    pub async fn inspect(&self) -> Result<SessionView, RejectReason> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionMsg::Inspect(reply)).await?;
        rx.await.map_err(|_| RejectReason::SessionClosed)
    }

    pub async fn disconnect(&self) {
        let _ = self.tx.send(SessionMsg::Disconnect).await;
    }

    async fn send(&self, msg: SessionMsg) -> Result<(), RejectReason> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| RejectReason::SessionClosed)
    }
}

pub struct SessionActor {
    session: MovementSession,
    rx: mpsc::Receiver<SessionMsg>,
    events_tx: mpsc::Sender<SessionEvent>,
    ctx: SessionContext,
    armed: Option<u64>,
    /// Set when the connection stopped draining events
    lagging: bool,
}

impl SessionActor {
    /// Spawn an actor for a new mobile. The receiver carries events for the
    /// connection; dropping it, or letting it fill up, ends the session.
    pub fn spawn(
        mobile_id: MobileId,
        speed: SpeedProfile,
        position: Position,
        facing: Direction,
        ctx: SessionContext,
    ) -> (SessionHandle, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        ctx.timers.register(mobile_id, tx.clone());

        let actor = Self {
            session: MovementSession::new(mobile_id, &ctx.config, speed, position, facing),
            rx,
            events_tx,
            ctx,
            armed: None,
            lagging: false,
        };
        tokio::spawn(actor.run());

        (SessionHandle { mobile_id, tx }, events_rx)
    }

    async fn run(mut self) {
        let period = Duration::from_millis(self.ctx.config.stall_grace_ms.max(1));
        let mut watchdog = interval(period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.lagging {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(SessionMsg::Disconnect) | None => break,
                    Some(msg) => self.handle(msg).await,
                },
                _ = watchdog.tick() => self.reconcile().await,
                _ = self.events_tx.closed() => {
                    debug!(mobile_id = self.session.mobile_id(), "Connection dropped");
                    break;
                }
            }
            self.rearm();
        }

        let mobile_id = self.session.mobile_id();
        self.ctx.timers.cancel(mobile_id);
        self.session.on_disconnect();
        if self.ctx.world_tx.send(WorldEvent::Left(mobile_id)).await.is_err() {
            debug!(mobile_id, "World simulation channel closed before departure");
        }
    }

    async fn handle(&mut self, msg: SessionMsg) {
        let now = self.ctx.clock.now_ms();
        match msg {
            SessionMsg::EnterWorld => {
                let tickets = self.session.on_world_entry(now);
                if !tickets.is_empty() {
                    self.emit(SessionEvent::Tickets(tickets));
                }
            }
            SessionMsg::Submit { command, reply } => {
                let result = self.session.submit(command, now).map_err(|reason| {
                    let state = self.session.state();
                    Rejection {
                        reason,
                        position: state.position,
                        facing: state.facing,
                        violations: self.session.violations(),
                    }
                });
                let _ = reply.send(result);
            }
            SessionMsg::Teleport { position, facing } => {
                self.session.teleport(position, facing);
            }
            SessionMsg::SetSpeed(speed) => {
                self.session.set_speed(speed);
            }
            SessionMsg::Inspect(reply) => {
                let _ = reply.send(self.session.view());
            }
            SessionMsg::TimerFired => {
                self.armed = None;
                let completions = self.session.on_timer(now);
                self.publish(completions).await;
            }
            SessionMsg::Disconnect => {}
        }
    }

    async fn reconcile(&mut self) {
        let now = self.ctx.clock.now_ms();
        if let Some(completion) = self.session.reconcile(now) {
            self.publish(vec![completion]).await;
        }
    }

    async fn publish(&mut self, completions: Vec<Completion>) {
        for completion in completions {
            let update = completion.update;
            debug!(
                mobile_id = update.mobile_id,
                timestamp = update.timestamp,
                forced = completion.forced,
                "Step completed"
            );
            if self.ctx.world_tx.send(WorldEvent::Moved(update)).await.is_err() {
                warn!(
                    mobile_id = update.mobile_id,
                    "World simulation channel closed, position update lost"
                );
            }
            self.emit(SessionEvent::Moved(update));
            if !completion.replenished.is_empty() {
                self.emit(SessionEvent::Tickets(completion.replenished));
            }
        }
    }

    /// Queue an event for the connection without waiting on it
    fn emit(&mut self, event: SessionEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.lagging {
                    warn!(
                        mobile_id = self.session.mobile_id(),
                        capacity = EVENT_CAPACITY,
                        "Connection not draining session events, closing"
                    );
                }
                self.lagging = true;
            }
            // The run loop notices the closed receiver on its next pass
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn rearm(&mut self) {
        match self.session.next_deadline() {
            Some(deadline) if self.armed != Some(deadline) => {
                self.ctx.timers.arm(self.session.mobile_id(), deadline);
                self.armed = Some(deadline);
            }
            Some(_) => {}
            None => self.armed = None,
        }
    }
}
