//! Shared multiplexed message bus.
//!
//! One ordered queue of `(destination, payload)` envelopes is shared by
//! every component. There is no dispatcher: each component polls the queue
//! under its own [`Consumer`] identity and takes the oldest envelope meant
//! for it, leaving the rest in place. Nothing is ever dropped; ordering
//! across destinations is not preserved, ordering per producer and
//! destination is.

mod message;

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

pub use message::{
    Control, FetchProgress, FetchStage, FileInfo, FinishOrigin, HealthBar, Importance, Notice,
    Payload, SlotStatus, StatusMessage,
};

/// Default polling interval of bus consumers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where an envelope is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Status stream of one slot.
    Slot(usize),
    /// Operator console.
    Display,
    /// Slot control traffic handled by the subprocess monitor.
    SlotControl,
    /// Channel bookkeeping and run control handled by the scheduler.
    ChannelState,
}

impl Destination {
    pub const DISPLAY_SENTINEL: i64 = -1;
    pub const SLOT_CONTROL_SENTINEL: i64 = -2;
    pub const CHANNEL_STATE_SENTINEL: i64 = -3;

    /// Integer form: a slot index, or one of the negative sentinels.
    pub fn as_raw(&self) -> i64 {
        match self {
            Destination::Slot(index) => *index as i64,
            Destination::Display => Self::DISPLAY_SENTINEL,
            Destination::SlotControl => Self::SLOT_CONTROL_SENTINEL,
            Destination::ChannelState => Self::CHANNEL_STATE_SENTINEL,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            Self::DISPLAY_SENTINEL => Some(Destination::Display),
            Self::SLOT_CONTROL_SENTINEL => Some(Destination::SlotControl),
            Self::CHANNEL_STATE_SENTINEL => Some(Destination::ChannelState),
            index if index >= 0 => Some(Destination::Slot(index as usize)),
            _ => None,
        }
    }
}

/// A payload addressed to a destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub destination: Destination,
    pub payload: Payload,
}

/// Identity a component consumes the bus under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumer {
    /// A slot's own callback: the terminal sentinel and halt requests.
    Slot(usize),
    /// The console: display messages and every non-terminal slot update.
    Display,
    /// The subprocess monitor.
    Monitor,
    /// The scheduler.
    Manager,
}

impl Consumer {
    /// Whether this consumer takes the envelope.
    pub fn accepts(&self, envelope: &Envelope) -> bool {
        match (self, envelope.destination) {
            (Consumer::Slot(own), Destination::Slot(index)) => {
                *own == index && envelope.payload.is_slot_bound()
            }
            (Consumer::Display, Destination::Display) => true,
            (Consumer::Display, Destination::Slot(_)) => !envelope.payload.is_slot_bound(),
            (Consumer::Monitor, Destination::SlotControl) => true,
            (Consumer::Manager, Destination::ChannelState) => true,
            _ => false,
        }
    }
}

/// The shared envelope queue.
#[derive(Debug)]
pub struct Bus {
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    poll_interval: Duration,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl Bus {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Append an envelope. Never blocks beyond the queue lock.
    pub fn publish(&self, destination: Destination, payload: Payload) {
        self.push(Envelope {
            destination,
            payload,
        });
    }

    fn push(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
        self.notify.notify_waiters();
    }

    /// Number of envelopes waiting.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Take at most one payload for `consumer`, waiting up to `timeout`.
    ///
    /// If only envelopes for other consumers are queued, `None` is returned
    /// after one poll interval unless a matching envelope arrives first.
    pub async fn consume(&self, consumer: Consumer, timeout: Duration) -> Option<Payload> {
        self.consume_envelope(consumer, timeout)
            .await
            .map(|envelope| envelope.payload)
    }

    /// Like [`Bus::consume`], keeping the destination.
    pub async fn consume_envelope(&self, consumer: Consumer, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        let mut foreign_deadline = None;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait_until = {
                let mut queue = self.queue.lock();
                if let Some(index) = queue.iter().position(|e| consumer.accepts(e)) {
                    return queue.remove(index);
                }
                if queue.is_empty() {
                    deadline
                } else {
                    trace!(?consumer, pending = queue.len(), "No envelope for consumer");
                    *foreign_deadline
                        .get_or_insert_with(|| (Instant::now() + self.poll_interval).min(deadline))
                }
            };

            if tokio::time::timeout_at(wait_until, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Remove and return every queued envelope.
    pub fn drain(&self) -> Vec<Envelope> {
        self.queue.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bus() -> Bus {
        Bus::new(Duration::from_millis(5))
    }

    #[test]
    fn test_destination_raw_mapping() {
        for destination in [
            Destination::Slot(0),
            Destination::Slot(7),
            Destination::Display,
            Destination::SlotControl,
            Destination::ChannelState,
        ] {
            assert_eq!(Destination::from_raw(destination.as_raw()), Some(destination));
        }
        assert_eq!(Destination::Display.as_raw(), -1);
        assert_eq!(Destination::from_raw(-4), None);
    }

    #[test]
    fn test_consumer_acceptance() {
        let finished = Envelope {
            destination: Destination::Slot(2),
            payload: Payload::Finished(FinishOrigin::Worker),
        };
        let recording = Envelope {
            destination: Destination::Slot(2),
            payload: Payload::Recording,
        };
        assert!(Consumer::Slot(2).accepts(&finished));
        assert!(!Consumer::Slot(1).accepts(&finished));
        assert!(!Consumer::Slot(2).accepts(&recording));
        assert!(Consumer::Display.accepts(&recording));
        assert!(!Consumer::Display.accepts(&finished));
        assert!(!Consumer::Manager.accepts(&recording));

        let halt = Envelope {
            destination: Destination::Slot(2),
            payload: Payload::Control(Control::Halt),
        };
        assert!(Consumer::Slot(2).accepts(&halt));
        assert!(!Consumer::Display.accepts(&halt));
    }

    #[tokio::test]
    async fn test_consume_own_message() {
        let bus = bus();
        bus.publish(Destination::SlotControl, Payload::Control(Control::KillSlot(1)));
        let payload = bus
            .consume(Consumer::Monitor, Duration::from_millis(50))
            .await;
        assert_eq!(payload, Some(Payload::Control(Control::KillSlot(1))));
        assert_eq!(bus.pending(), 0);
    }

    #[tokio::test]
    async fn test_foreign_message_is_requeued() {
        let bus = bus();
        bus.publish(Destination::ChannelState, Payload::Control(Control::Shutdown));

        let payload = bus
            .consume(Consumer::Monitor, Duration::from_millis(50))
            .await;
        assert_eq!(payload, None);
        assert_eq!(bus.pending(), 1);

        let payload = bus
            .consume(Consumer::Manager, Duration::from_millis(50))
            .await;
        assert_eq!(payload, Some(Payload::Control(Control::Shutdown)));
    }

    #[tokio::test]
    async fn test_consume_times_out_on_empty_queue() {
        let bus = bus();
        let started = Instant::now();
        assert_eq!(
            bus.consume(Consumer::Display, Duration::from_millis(20)).await,
            None
        );
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_consume_wakes_on_publish() {
        let bus = Arc::new(bus());
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(Destination::Display, Payload::Notice(Notice::notice("hi")));
        });

        let payload = bus
            .consume(Consumer::Display, Duration::from_secs(5))
            .await;
        assert_eq!(payload, Some(Payload::Notice(Notice::notice("hi"))));
    }

    #[tokio::test]
    async fn test_foreign_head_does_not_block_own_envelope() {
        let bus = bus();
        bus.publish(Destination::ChannelState, Payload::Control(Control::Shutdown));
        bus.publish(Destination::SlotControl, Payload::Control(Control::KillSlot(0)));

        let payload = bus
            .consume(Consumer::Monitor, Duration::from_millis(50))
            .await;
        assert_eq!(payload, Some(Payload::Control(Control::KillSlot(0))));
        assert_eq!(
            bus.drain(),
            vec![Envelope {
                destination: Destination::ChannelState,
                payload: Payload::Control(Control::Shutdown),
            }]
        );
    }

    #[tokio::test]
    async fn test_two_consumers_with_interleaved_traffic() {
        let bus = Arc::new(bus());
        bus.publish(Destination::ChannelState, Payload::Control(Control::Shutdown));
        bus.publish(Destination::SlotControl, Payload::Control(Control::KillSlot(1)));

        let monitor_bus = bus.clone();
        let monitor = tokio::spawn(async move {
            monitor_bus
                .consume(Consumer::Monitor, Duration::from_secs(2))
                .await
        });
        let manager_bus = bus.clone();
        let manager = tokio::spawn(async move {
            manager_bus
                .consume(Consumer::Manager, Duration::from_secs(2))
                .await
        });

        assert_eq!(
            monitor.await.unwrap(),
            Some(Payload::Control(Control::KillSlot(1)))
        );
        assert_eq!(
            manager.await.unwrap(),
            Some(Payload::Control(Control::Shutdown))
        );
        assert_eq!(bus.pending(), 0);
    }

    #[tokio::test]
    async fn test_no_loss_with_concurrent_consumers() {
        let bus = Arc::new(bus());
        for i in 0..20 {
            bus.publish(Destination::SlotControl, Payload::Control(Control::FetchEnded(i)));
            bus.publish(
                Destination::ChannelState,
                Payload::ChannelUpdate(crate::domain::Channel::new(format!("ch{i}"))),
            );
        }

        let monitor_bus = bus.clone();
        let monitor = tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 20 {
                if let Some(Payload::Control(Control::FetchEnded(i))) = monitor_bus
                    .consume(Consumer::Monitor, Duration::from_millis(20))
                    .await
                {
                    seen.push(i);
                }
            }
            seen
        });
        let manager_bus = bus.clone();
        let manager = tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 20 {
                if let Some(Payload::ChannelUpdate(channel)) = manager_bus
                    .consume(Consumer::Manager, Duration::from_millis(20))
                    .await
                {
                    seen.push(channel.name);
                }
            }
            seen
        });

        let monitor_seen = monitor.await.unwrap();
        let manager_seen = manager.await.unwrap();
        // Same producer, same destination: order is kept.
        assert_eq!(monitor_seen, (0..20).collect::<Vec<_>>());
        assert_eq!(
            manager_seen,
            (0..20).map(|i| format!("ch{i}")).collect::<Vec<_>>()
        );
        assert_eq!(bus.pending(), 0);
    }
}
