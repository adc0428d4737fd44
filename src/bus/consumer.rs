//! Background consume loop.
//!
//! One thread per bus. It owns a [`BrokerConsumer`], keeps the set of
//! event names it listens to in step with the registry, and dispatches
//! every delivery to the registered handlers before settling it.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::broker::{BrokerAdapter, BrokerConsumer, Delivery};
use crate::error::BusError;
use crate::handler::{HandlerError, HandlerResolver};
use crate::registry::SubscriptionRegistry;

/// Counters reported by a consume loop when it stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Receive calls, including ones that timed out.
    pub polls: u64,
    /// Messages dispatched to their handlers and acknowledged.
    pub handled: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Messages rejected because no subscription or decoder matched.
    pub dropped: u64,
    /// Failed ack/reject calls; those messages are redelivered.
    pub ack_failures: u64,
}

/// Handle to a running consume loop.
pub(crate) struct ConsumerHandle {
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<ConsumerStats>>,
}

impl ConsumerHandle {
    /// Stop the loop and wait for it to finish. Returns stats.
    ///
    /// When called from the loop's own thread (a handler dropping the last
    /// reference to its bus) the loop is only signalled.
    pub(crate) fn stop(mut self) -> ConsumerStats {
        let _ = self.stop_tx.send(());
        let Some(handle) = self.handle.take() else {
            return ConsumerStats::default();
        };
        if handle.thread().id() == thread::current().id() {
            return ConsumerStats::default();
        }
        handle.join().unwrap_or_default()
    }

    /// Signal stop without waiting.
    pub(crate) fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

pub(crate) struct ConsumeLoop {
    pub(crate) broker: Arc<dyn BrokerAdapter>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) resolver: Arc<dyn HandlerResolver>,
    /// Held while declaring bindings, shared with subscribe/unsubscribe.
    pub(crate) topology: Arc<Mutex<()>>,
    pub(crate) poll_interval: Duration,
    /// Pause before reopening after the broker could not be reached.
    pub(crate) reopen_delay: Duration,
}

struct Session {
    consumer: Box<dyn BrokerConsumer>,
    listening: HashSet<String>,
}

enum Outcome {
    Settled,
    /// The session can no longer be trusted; open a new one.
    Broken,
}

impl ConsumeLoop {
    pub(crate) fn spawn(self) -> Result<ConsumerHandle, BusError> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("bus-consumer".into())
            .spawn(move || self.run(stop_rx))
            .map_err(BusError::Spawn)?;
        Ok(ConsumerHandle {
            stop_tx,
            handle: Some(handle),
        })
    }

    fn run(self, stop_rx: mpsc::Receiver<()>) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        let mut session: Option<Session> = None;
        info!(broker = %self.broker.kind(), "consumer started");

        loop {
            match stop_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let Some(active) = session.as_mut() else {
                match self.open() {
                    Ok(opened) => session = Some(opened),
                    Err(BusError::Disposed) => break,
                    Err(err) => {
                        warn!(error = %err, "consumer could not open a session");
                        match stop_rx.recv_timeout(self.reopen_delay) {
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                            Err(RecvTimeoutError::Timeout) => {}
                        }
                    }
                }
                continue;
            };

            if let Err(err) = self.reconcile(active) {
                warn!(error = %err, "consumer lost its session while updating bindings");
                session = None;
                continue;
            }

            stats.polls += 1;
            match active.consumer.next(self.poll_interval) {
                Ok(None) => {}
                Ok(Some(delivery)) => {
                    let outcome = self.process(active.consumer.as_mut(), &delivery, &mut stats);
                    if let Outcome::Broken = outcome {
                        session = None;
                    }
                }
                Err(BusError::Disposed) => break,
                Err(err) => {
                    warn!(error = %err, "receive failed, reopening consumer");
                    session = None;
                }
            }
        }

        info!(
            polls = stats.polls,
            handled = stats.handled,
            dropped = stats.dropped,
            handler_failures = stats.handler_failures,
            ack_failures = stats.ack_failures,
            "consumer stopped"
        );
        stats
    }

    fn open(&self) -> Result<Session, BusError> {
        let consumer = self.broker.open_consumer()?;
        debug!("consumer session opened");
        Ok(Session {
            consumer,
            listening: HashSet::new(),
        })
    }

    /// Listen to every registered event name and stop listening to the
    /// removed ones. New names get their binding declared first.
    fn reconcile(&self, session: &mut Session) -> Result<(), BusError> {
        let wanted: HashSet<String> = self.registry.event_names().into_iter().collect();

        let added: Vec<String> = wanted.difference(&session.listening).cloned().collect();
        for event_name in added {
            let _topology = self.topology.lock().unwrap_or_else(PoisonError::into_inner);
            // Unsubscribed since `wanted` was read; its binding is gone.
            if !self.registry.has_subscriptions_for_event(&event_name) {
                continue;
            }
            self.broker.declare_binding(&event_name)?;
            session.consumer.listen(&event_name)?;
            debug!(event_name = %event_name, "listening");
            session.listening.insert(event_name);
        }

        let removed: Vec<String> = session.listening.difference(&wanted).cloned().collect();
        for event_name in removed {
            session.consumer.unlisten(&event_name)?;
            debug!(event_name = %event_name, "stopped listening");
            session.listening.remove(&event_name);
        }
        Ok(())
    }

    fn process(
        &self,
        consumer: &mut dyn BrokerConsumer,
        delivery: &Delivery,
        stats: &mut ConsumerStats,
    ) -> Outcome {
        let message = &delivery.message;
        let event_name = message.event_name.as_str();

        let Some((event_type, handlers)) = self.registry.lookup(event_name) else {
            warn!(event_name, message_id = %message.id, "no subscription for event, dropping");
            stats.dropped += 1;
            return self.settle(consumer.reject(delivery), stats);
        };

        let event = match event_type.decode(&message.content_type, &message.payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(event_name, message_id = %message.id, error = %err, "undecodable message, dropping");
                stats.dropped += 1;
                return self.settle(consumer.reject(delivery), stats);
            }
        };

        debug!(
            event_name,
            message_id = %message.id,
            handlers = handlers.len(),
            redelivered = delivery.redelivered,
            "dispatching"
        );
        for info in &handlers {
            let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
                info.invoke(&*self.resolver, &*event)
            }));
            let result = invoked
                .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(&*payload))));
            if let Err(err) = result {
                stats.handler_failures += 1;
                warn!(
                    event_name,
                    message_id = %message.id,
                    handler = %info.handler_type(),
                    error = %err,
                    "handler failed"
                );
            }
        }

        stats.handled += 1;
        self.settle(consumer.ack(delivery), stats)
    }

    fn settle(&self, result: Result<(), BusError>, stats: &mut ConsumerStats) -> Outcome {
        match result {
            Ok(()) => Outcome::Settled,
            Err(err) => {
                stats.ack_failures += 1;
                warn!(error = %err, "settling message failed, it will be redelivered");
                Outcome::Broken
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
