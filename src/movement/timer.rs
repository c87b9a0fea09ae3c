//! Shared completion-timer dispatch
//!
//! One task keeps a min-heap of `(deadline, mobile)` entries for every
//! session. When an entry comes due it only posts `SessionMsg::TimerFired`
//! into the owning session's mailbox; all state changes happen inside the
//! session actor.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::sleep_until;
use tracing::{debug, info};

use crate::util::time::ServerClock;

use super::actor::SessionMsg;
use super::types::MobileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: u64,
    seq: u64,
    mobile_id: MobileId,
}

enum TimerCommand {
    Register {
        mobile_id: MobileId,
        mailbox: mpsc::Sender<SessionMsg>,
    },
    Arm {
        mobile_id: MobileId,
        deadline: u64,
    },
    Cancel {
        mobile_id: MobileId,
    },
}

/// Cheap cloneable handle used by sessions to arm and cancel timers
#[derive(Clone)]
pub struct TimerHandle {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl TimerHandle {
    pub fn register(&self, mobile_id: MobileId, mailbox: mpsc::Sender<SessionMsg>) {
        let _ = self.tx.send(TimerCommand::Register { mobile_id, mailbox });
    }

    pub fn arm(&self, mobile_id: MobileId, deadline: u64) {
        let _ = self.tx.send(TimerCommand::Arm {
            mobile_id,
            deadline,
        });
    }

    /// Drop every pending timer for `mobile_id`
    pub fn cancel(&self, mobile_id: MobileId) {
        let _ = self.tx.send(TimerCommand::Cancel { mobile_id });
    }
}

pub struct TimerDispatcher {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    mailboxes: HashMap<MobileId, mpsc::Sender<SessionMsg>>,
    rx: mpsc::UnboundedReceiver<TimerCommand>,
    clock: ServerClock,
    next_seq: u64,
}

impl TimerDispatcher {
    pub fn new(clock: ServerClock) -> (Self, TimerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            heap: BinaryHeap::new(),
            mailboxes: HashMap::new(),
            rx,
            clock,
            next_seq: 0,
        };
        (dispatcher, TimerHandle { tx })
    }

    /// Start the dispatcher on the runtime
    pub fn spawn(clock: ServerClock) -> TimerHandle {
        let (dispatcher, handle) = Self::new(clock);
        tokio::spawn(dispatcher.run());
        handle
    }

    pub async fn run(mut self) {
        loop {
            let next = self.heap.peek().map(|Reverse(entry)| entry.deadline);
            let clock = self.clock;
            let wait = async move {
                match next {
                    Some(deadline) => sleep_until(clock.instant_at(deadline)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = wait => {
                    let now = self.clock.now_ms();
                    self.fire_due(now);
                }
            }
        }

        info!("Timer dispatcher stopped");
    }

    fn handle(&mut self, cmd: TimerCommand) {
        match cmd {
            TimerCommand::Register { mobile_id, mailbox } => {
                self.mailboxes.insert(mobile_id, mailbox);
            }
            TimerCommand::Arm {
                mobile_id,
                deadline,
            } => {
                self.next_seq += 1;
                self.heap.push(Reverse(TimerEntry {
                    deadline,
                    seq: self.next_seq,
                    mobile_id,
                }));
            }
            TimerCommand::Cancel { mobile_id } => {
                self.mailboxes.remove(&mobile_id);
                self.heap.retain(|Reverse(entry)| entry.mobile_id != mobile_id);
            }
        }
    }

    /// Notify every session whose deadline has passed. Returns the number
    /// of notifications delivered.
    fn fire_due(&mut self, now: u64) -> usize {
        let mut delivered = 0;
        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            if entry.deadline > now {
                break;
            }
            self.heap.pop();

            let Some(mailbox) = self.mailboxes.get(&entry.mobile_id) else {
                continue;
            };
            match mailbox.try_send(SessionMsg::TimerFired) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    // The session's watchdog reconciles anything missed here
                    debug!(mobile_id = entry.mobile_id, "Session mailbox full, timer dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    self.mailboxes.remove(&entry.mobile_id);
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drain(dispatcher: &mut TimerDispatcher) {
        while let Ok(cmd) = dispatcher.rx.try_recv() {
            dispatcher.handle(cmd);
        }
    }

    #[tokio::test]
    async fn test_fires_only_due_entries_in_deadline_order() {
        let (mut dispatcher, handle) = TimerDispatcher::new(ServerClock::new());
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);

        handle.register(1, a_tx);
        handle.register(2, b_tx);
        handle.arm(1, 300);
        handle.arm(2, 100);
        handle.arm(1, 900);
        drain(&mut dispatcher);

        assert_eq!(dispatcher.fire_due(500), 2);
        assert!(matches!(a_rx.try_recv(), Ok(SessionMsg::TimerFired)));
        assert!(matches!(b_rx.try_recv(), Ok(SessionMsg::TimerFired)));
        assert!(a_rx.try_recv().is_err());
        assert_eq!(dispatcher.heap.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_purges_entries() {
        let (mut dispatcher, handle) = TimerDispatcher::new(ServerClock::new());
        let (tx, mut rx) = mpsc::channel(8);

        handle.register(5, tx);
        handle.arm(5, 10);
        handle.arm(5, 20);
        handle.cancel(5);
        drain(&mut dispatcher);

        assert!(dispatcher.heap.is_empty());
        assert_eq!(dispatcher.fire_due(1_000), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_mailbox_is_forgotten() {
        let (mut dispatcher, handle) = TimerDispatcher::new(ServerClock::new());
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        handle.register(9, tx);
        handle.arm(9, 0);
        drain(&mut dispatcher);

        assert_eq!(dispatcher.fire_due(0), 0);
        assert!(dispatcher.mailboxes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_dispatcher_wakes_at_deadline() {
        let clock = ServerClock::new();
        let handle = TimerDispatcher::spawn(clock);
        let (tx, mut rx) = mpsc::channel(8);

        handle.register(3, tx);
        handle.arm(3, 400);

        let fired = tokio::time::timeout(Duration::from_millis(1_000), rx.recv()).await;
        assert!(matches!(fired, Ok(Some(SessionMsg::TimerFired))));
        assert!(clock.now_ms() >= 400);
    }
}
