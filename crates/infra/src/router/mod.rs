//! Event router: at-least-once fan-out of committed events to external consumers.
//!
//! Every subscription owns one delivery worker thread. The worker pages the global
//! log from the subscription's cursor, skips events the filter rejects, and hands
//! each matching event to the consumer through its [`DeliveryChannel`]. The cursor
//! moves only when the consumer acknowledges. Failures are retried with backoff;
//! once the retry budget is spent the subscription is dead-lettered and waits for
//! an operator reset.
//!
//! The subscription map is the explicit graph of "who consumes what":
//! [`EventRouter::subscriptions`] lists every consumer with its filter and cursor.

pub mod retry;

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use stocklens_core::{ConsumerId, GlobalVersion};
use stocklens_events::{CommitNotice, EventBus, EventEnvelope, EventFilter, InMemoryEventBus};

use crate::event_store::SharedEventStore;
use crate::workers::WorkerHandle;

pub use retry::{DeadLetterEntry, RetryDecision, RetryPolicy};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown consumer: {0}")]
    UnknownConsumer(ConsumerId),

    #[error("delivery worker for {0} has stopped")]
    WorkerGone(ConsumerId),

    #[error("failed to spawn delivery worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("router state lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Active,
    /// Waiting out the backoff before redelivering the same event.
    Backoff,
    /// Retry budget exhausted; idle until `reset_subscription`.
    DeadLettered,
    /// The consumer dropped its channel; the worker has stopped. Re-subscribe to resume.
    Disconnected,
}

/// Point-in-time view of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub consumer_id: ConsumerId,
    pub filter: EventFilter,
    /// Last acknowledged (or skipped) global version.
    pub cursor: GlobalVersion,
    pub state: DeliveryState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// One event handed to a consumer. `attempt` starts at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub event: EventEnvelope,
    pub attempt: u32,
}

#[derive(Debug)]
enum Ack {
    /// Everything up to and including this version is processed.
    Ack(GlobalVersion),
    Nack { global_version: GlobalVersion, reason: String },
}

#[derive(Debug)]
enum Signal {
    Wake,
    Reset,
    Shutdown,
}

/// Consumer side of a subscription.
///
/// Dropping it ends the subscription's worker; re-subscribe with the last
/// acknowledged cursor to resume.
#[derive(Debug)]
pub struct DeliveryChannel {
    consumer_id: ConsumerId,
    deliveries: Receiver<Delivery>,
    acks: Sender<Ack>,
}

impl DeliveryChannel {
    pub fn consumer_id(&self) -> &ConsumerId {
        &self.consumer_id
    }

    pub fn recv(&self) -> Option<Delivery> {
        self.deliveries.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
        self.deliveries.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }

    /// Acknowledge every delivered event up to `global_version`.
    pub fn ack(&self, global_version: GlobalVersion) -> Result<(), RouterError> {
        self.acks
            .send(Ack::Ack(global_version))
            .map_err(|_| RouterError::WorkerGone(self.consumer_id.clone()))
    }

    /// Report that the event at `global_version` could not be processed.
    pub fn nack(&self, global_version: GlobalVersion, reason: impl Into<String>) -> Result<(), RouterError> {
        self.acks
            .send(Ack::Nack {
                global_version,
                reason: reason.into(),
            })
            .map_err(|_| RouterError::WorkerGone(self.consumer_id.clone()))
    }
}

/// Router tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterSettings {
    /// Events read from the log per page.
    pub batch_size: usize,
    /// How long a delivery may stay unacknowledged before it counts as failed.
    pub ack_timeout: Duration,
    pub retry: RetryPolicy,
    /// Idle poll interval when no commit notice arrives.
    pub idle_tick: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            batch_size: 256,
            ack_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            idle_tick: Duration::from_millis(500),
        }
    }
}

struct Slot {
    info: Arc<Mutex<SubscriptionInfo>>,
    signals: Sender<Signal>,
    worker: WorkerHandle,
}

pub struct EventRouter {
    store: SharedEventStore,
    bus: Arc<InMemoryEventBus<CommitNotice>>,
    settings: RouterSettings,
    slots: Mutex<BTreeMap<ConsumerId, Slot>>,
    dead_letters: Arc<Mutex<Vec<DeadLetterEntry>>>,
}

impl EventRouter {
    pub fn new(store: SharedEventStore, bus: Arc<InMemoryEventBus<CommitNotice>>, settings: RouterSettings) -> Self {
        Self {
            store,
            bus,
            settings,
            slots: Mutex::new(BTreeMap::new()),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Notification bus carrying commit notices (projection workers listen here).
    pub fn bus(&self) -> &Arc<InMemoryEventBus<CommitNotice>> {
        &self.bus
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    fn slots(&self) -> Result<MutexGuard<'_, BTreeMap<ConsumerId, Slot>>, RouterError> {
        self.slots.lock().map_err(|_| RouterError::Poisoned)
    }

    /// Register `consumer_id` and start delivering events after `start_cursor`.
    ///
    /// An existing subscription for the same consumer is stopped and replaced.
    pub fn subscribe(
        &self,
        consumer_id: ConsumerId,
        filter: EventFilter,
        start_cursor: GlobalVersion,
    ) -> Result<DeliveryChannel, RouterError> {
        let info = Arc::new(Mutex::new(SubscriptionInfo {
            consumer_id: consumer_id.clone(),
            filter: filter.clone(),
            cursor: start_cursor,
            state: DeliveryState::Active,
            consecutive_failures: 0,
            last_error: None,
        }));
        let (delivery_tx, delivery_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        let (signal_tx, signal_rx) = mpsc::channel();

        let worker = DeliveryWorker {
            consumer_id: consumer_id.clone(),
            filter,
            store: self.store.clone(),
            settings: self.settings.clone(),
            info: info.clone(),
            dead_letters: self.dead_letters.clone(),
            deliveries: delivery_tx,
            acks: ack_rx,
            signals: signal_rx,
        };
        let name = format!("delivery-{consumer_id}");
        let join = thread::Builder::new().name(name.clone()).spawn(move || worker.run())?;
        let stop_tx = signal_tx.clone();
        let stop = move || {
            let _ = stop_tx.send(Signal::Shutdown);
        };
        let slot = Slot {
            info,
            signals: signal_tx,
            worker: WorkerHandle::new(name, stop, join),
        };

        let replaced = self.slots()?.insert(consumer_id.clone(), slot);
        if let Some(old) = replaced {
            info!(consumer = %consumer_id, "subscription replaced");
            old.stop();
        }
        info!(
            consumer = %consumer_id,
            start_cursor,
            max_stall_ms = self.settings.retry.worst_case_stall().as_millis() as u64,
            "subscription started"
        );
        Ok(DeliveryChannel {
            consumer_id,
            deliveries: delivery_rx,
            acks: ack_tx,
        })
    }

    /// Stop delivering to `consumer_id` and forget the subscription.
    pub fn unsubscribe(&self, consumer_id: &ConsumerId) -> Result<(), RouterError> {
        let slot = self
            .slots()?
            .remove(consumer_id)
            .ok_or_else(|| RouterError::UnknownConsumer(consumer_id.clone()))?;
        slot.stop();
        info!(consumer = %consumer_id, "subscription removed");
        Ok(())
    }

    /// Operator action: clear a dead-lettered subscription so it redelivers its
    /// blocked event from attempt 1.
    pub fn reset_subscription(&self, consumer_id: &ConsumerId) -> Result<(), RouterError> {
        let slots = self.slots()?;
        let slot = slots
            .get(consumer_id)
            .ok_or_else(|| RouterError::UnknownConsumer(consumer_id.clone()))?;
        slot.signals
            .send(Signal::Reset)
            .map_err(|_| RouterError::WorkerGone(consumer_id.clone()))?;
        warn!(consumer = %consumer_id, "subscription reset requested");
        Ok(())
    }

    /// Announce a new head: publish a commit notice and wake every delivery worker.
    ///
    /// Never blocks on a subscriber.
    pub fn notify(&self, head: GlobalVersion) {
        if let Err(err) = self.bus.publish(CommitNotice { head }) {
            warn!(head, error = ?err, "commit notice not published");
        }
        if let Ok(slots) = self.slots.lock() {
            for slot in slots.values() {
                let _ = slot.signals.send(Signal::Wake);
            }
        }
    }

    pub fn subscription(&self, consumer_id: &ConsumerId) -> Option<SubscriptionInfo> {
        let slots = self.slots.lock().ok()?;
        slots.get(consumer_id).map(|slot| lock_info(&slot.info).clone())
    }

    /// Every subscription, ordered by consumer id.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        match self.slots.lock() {
            Ok(slots) => slots.values().map(|slot| lock_info(&slot.info).clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop every delivery worker.
    pub fn shutdown(&self) {
        let drained: Vec<Slot> = match self.slots.lock() {
            Ok(mut slots) => std::mem::take(&mut *slots).into_values().collect(),
            Err(_) => Vec::new(),
        };
        for slot in drained {
            slot.stop();
        }
        info!("router stopped");
    }
}

impl core::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventRouter")
            .field("settings", &self.settings)
            .field("subscriptions", &self.subscriptions().len())
            .finish()
    }
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Slot {
    fn stop(self) {
        self.worker.shutdown();
    }
}

fn lock_info(info: &Mutex<SubscriptionInfo>) -> MutexGuard<'_, SubscriptionInfo> {
    info.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Outcome {
    Acked,
    Failed(String),
    /// Consumer went away or shutdown was requested.
    Stop,
}

struct DeliveryWorker {
    consumer_id: ConsumerId,
    filter: EventFilter,
    store: SharedEventStore,
    settings: RouterSettings,
    info: Arc<Mutex<SubscriptionInfo>>,
    dead_letters: Arc<Mutex<Vec<DeadLetterEntry>>>,
    deliveries: Sender<Delivery>,
    acks: Receiver<Ack>,
    signals: Receiver<Signal>,
}

impl DeliveryWorker {
    fn run(self) {
        loop {
            match self.signals.try_recv() {
                Ok(Signal::Shutdown) | Err(TryRecvError::Disconnected) => break,
                Ok(Signal::Reset) => self.reset(),
                Ok(Signal::Wake) | Err(TryRecvError::Empty) => {}
            }
            if self.consumer_gone() {
                self.mark_disconnected();
                break;
            }

            let (cursor, state) = {
                let info = lock_info(&self.info);
                (info.cursor, info.state)
            };
            if state == DeliveryState::DeadLettered {
                if !self.idle(self.settings.idle_tick) {
                    break;
                }
                continue;
            }

            let page = match self.store.read_global(cursor + 1, self.settings.batch_size.max(1)) {
                Ok(page) => page,
                Err(err) => {
                    warn!(consumer = %self.consumer_id, error = %err, "delivery read failed");
                    if !self.idle(self.settings.idle_tick) {
                        break;
                    }
                    continue;
                }
            };
            if page.is_empty() {
                if !self.idle(self.settings.idle_tick) {
                    break;
                }
                continue;
            }

            if !self.deliver_page(page) {
                break;
            }
        }
        debug!(consumer = %self.consumer_id, "delivery worker stopped");
    }

    /// Returns `false` when the worker must stop.
    fn deliver_page(&self, page: Vec<EventEnvelope>) -> bool {
        for event in page {
            let gv = event.global_version();
            if !self.filter.matches(&event) {
                lock_info(&self.info).cursor = gv;
                continue;
            }

            loop {
                let attempt = lock_info(&self.info).consecutive_failures + 1;
                match self.deliver(&event, attempt) {
                    Outcome::Stop => return false,
                    Outcome::Acked => {
                        let mut info = lock_info(&self.info);
                        info.cursor = gv;
                        info.state = DeliveryState::Active;
                        info.consecutive_failures = 0;
                        info.last_error = None;
                        break;
                    }
                    Outcome::Failed(reason) => {
                        let Some(delay) = self.record_failure(&event, attempt, reason) else {
                            // Dead-lettered: let the outer loop idle until reset.
                            return true;
                        };
                        if !self.backoff(delay) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    fn deliver(&self, event: &EventEnvelope, attempt: u32) -> Outcome {
        let gv = event.global_version();
        let delivery = Delivery {
            event: event.clone(),
            attempt,
        };
        if self.deliveries.send(delivery).is_err() {
            self.mark_disconnected();
            return Outcome::Stop;
        }

        // Wait in idle-tick slices so a shutdown is noticed while the consumer is busy.
        let deadline = Instant::now() + self.settings.ack_timeout;
        loop {
            if self.shutdown_requested() {
                return Outcome::Stop;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Outcome::Failed(format!(
                    "not acknowledged within {} ms",
                    self.settings.ack_timeout.as_millis()
                ));
            }
            match self.acks.recv_timeout(remaining.min(self.settings.idle_tick)) {
                Ok(Ack::Ack(acked)) if acked >= gv => return Outcome::Acked,
                Ok(Ack::Nack { global_version, reason }) if global_version == gv => {
                    return Outcome::Failed(reason);
                }
                // Late acks or nacks for earlier deliveries.
                Ok(_) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.mark_disconnected();
                    return Outcome::Stop;
                }
            }
        }
    }

    /// True once the consumer dropped its channel. Only called with no delivery in flight.
    fn consumer_gone(&self) -> bool {
        loop {
            match self.acks.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn mark_disconnected(&self) {
        let mut info = lock_info(&self.info);
        info.state = DeliveryState::Disconnected;
        info!(consumer = %self.consumer_id, cursor = info.cursor, "consumer disconnected");
    }

    fn shutdown_requested(&self) -> bool {
        loop {
            match self.signals.try_recv() {
                Ok(Signal::Shutdown) | Err(TryRecvError::Disconnected) => return true,
                Ok(Signal::Wake) => continue,
                Ok(Signal::Reset) => self.reset(),
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    /// Returns the wait before redelivery, or `None` once the subscription is dead-lettered.
    fn record_failure(&self, event: &EventEnvelope, attempt: u32, reason: String) -> Option<Duration> {
        let gv = event.global_version();
        let mut info = lock_info(&self.info);
        info.consecutive_failures = attempt;
        info.last_error = Some(reason.clone());

        if let RetryDecision::Redeliver { after } = self.settings.retry.after_failure(attempt) {
            info.state = DeliveryState::Backoff;
            warn!(
                consumer = %self.consumer_id,
                global_version = gv,
                attempt,
                retry_in_ms = after.as_millis() as u64,
                reason = %reason,
                "delivery failed, will retry"
            );
            return Some(after);
        }

        info.state = DeliveryState::DeadLettered;
        drop(info);
        error!(
            consumer = %self.consumer_id,
            global_version = gv,
            attempts = attempt,
            reason = %reason,
            alert = true,
            "subscription dead-lettered"
        );
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeadLetterEntry {
                consumer_id: self.consumer_id.clone(),
                global_version: gv,
                event_type: event.event_type().to_string(),
                attempts: attempt,
                reason,
                dead_lettered_at: Utc::now(),
            });
        None
    }

    fn reset(&self) {
        let mut info = lock_info(&self.info);
        if info.state == DeliveryState::DeadLettered {
            info!(consumer = %self.consumer_id, cursor = info.cursor, "subscription reactivated");
        }
        info.state = DeliveryState::Active;
        info.consecutive_failures = 0;
        info.last_error = None;
    }

    /// Sleep for the backoff delay, still honouring shutdown. Returns `false` on shutdown.
    fn backoff(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            match self.signals.recv_timeout(remaining) {
                Ok(Signal::Wake) => continue,
                Ok(Signal::Reset) => self.reset(),
                Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
                Err(RecvTimeoutError::Timeout) => return true,
            }
        }
    }

    /// Wait for a wake-up or the idle tick. Returns `false` on shutdown.
    fn idle(&self, tick: Duration) -> bool {
        match self.signals.recv_timeout(tick) {
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => false,
            Ok(Signal::Reset) => {
                self.reset();
                true
            }
            Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => true,
        }
    }
}
