//! Matches broker acknowledgements to the requests that caused them.
//!
//! `rumqttc` queues requests without telling the caller which packet id they
//! were given. The event loop reports each packet id as the request goes out
//! (`Outgoing::Subscribe(pkid)`, `Outgoing::Publish(pkid)`), in the order the
//! requests were queued. Waiters are therefore queued in the same order and
//! bound to a packet id when the matching outgoing event arrives.
//!
//! Callers must register a waiter and queue its request while holding a lock
//! that keeps the two orders identical.

use std::collections::{HashMap, VecDeque};

use rumqttc::{Outgoing, SubAck, SubscribeReasonCode};
use tokio::sync::{Mutex, oneshot};

/// How a tracked request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    /// The broker acknowledged the request.
    Accepted,
    /// The broker answered with a failure return code.
    Refused,
    /// The connection dropped before an answer arrived.
    Lost,
}

type Waiter = oneshot::Sender<AckOutcome>;

#[derive(Debug, Default)]
struct Waiters {
    queued_subscribes: VecDeque<Waiter>,
    subscribes: HashMap<u16, Waiter>,
    queued_publishes: VecDeque<Waiter>,
    publishes: HashMap<u16, Waiter>,
}

/// Pending SUBSCRIBE and PUBLISH acknowledgements.
#[derive(Debug, Default)]
pub(crate) struct AckTracker {
    waiters: Mutex<Waiters>,
}

impl AckTracker {
    /// Registers a waiter for the next SUBSCRIBE request.
    pub(crate) async fn expect_subscribe(&self) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.queued_subscribes.push_back(tx);
        rx
    }

    /// Drops the most recent subscribe waiter after its request could not
    /// be queued.
    pub(crate) async fn forget_subscribe(&self) {
        self.waiters.lock().await.queued_subscribes.pop_back();
    }

    /// Registers a waiter for the next PUBLISH request.
    pub(crate) async fn expect_publish(&self) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.queued_publishes.push_back(tx);
        rx
    }

    /// Drops the most recent publish waiter after its request could not be
    /// queued.
    pub(crate) async fn forget_publish(&self) {
        self.waiters.lock().await.queued_publishes.pop_back();
    }

    /// Binds queued waiters to the packet ids the event loop reports.
    pub(crate) async fn on_outgoing(&self, outgoing: &Outgoing) {
        let mut waiters = self.waiters.lock().await;
        match *outgoing {
            Outgoing::Subscribe(pkid) => {
                if let Some(waiter) = waiters.queued_subscribes.pop_front() {
                    waiters.subscribes.insert(pkid, waiter);
                }
            }
            // QoS 0 never gets an ack: written is done
            Outgoing::Publish(0) => {
                if let Some(waiter) = waiters.queued_publishes.pop_front() {
                    let _ = waiter.send(AckOutcome::Accepted);
                }
            }
            Outgoing::Publish(pkid) => {
                // a retransmission after reconnect reuses its packet id
                if waiters.publishes.contains_key(&pkid) {
                    return;
                }
                if let Some(waiter) = waiters.queued_publishes.pop_front() {
                    waiters.publishes.insert(pkid, waiter);
                }
            }
            _ => {}
        }
    }

    /// Resolves the subscribe waiter for `ack`.
    pub(crate) async fn on_suback(&self, ack: &SubAck) {
        let Some(waiter) = self.waiters.lock().await.subscribes.remove(&ack.pkid) else {
            return;
        };
        let refused = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let outcome = if refused {
            AckOutcome::Refused
        } else {
            AckOutcome::Accepted
        };
        let _ = waiter.send(outcome);
    }

    /// Resolves the publish waiter for `pkid` (PUBACK or PUBCOMP).
    pub(crate) async fn on_publish_complete(&self, pkid: u16) {
        if let Some(waiter) = self.waiters.lock().await.publishes.remove(&pkid) {
            let _ = waiter.send(AckOutcome::Accepted);
        }
    }

    /// Fails subscribes already sent on a connection that went away.
    ///
    /// Unacknowledged publishes stay bound: `rumqttc` retransmits them with
    /// the same packet id once reconnected.
    pub(crate) async fn on_connection_lost(&self) {
        let mut waiters = self.waiters.lock().await;
        for (_, waiter) in waiters.subscribes.drain() {
            let _ = waiter.send(AckOutcome::Lost);
        }
        waiters.publishes.retain(|_, waiter| !waiter.is_closed());
    }
}
