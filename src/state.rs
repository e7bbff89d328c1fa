use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel as channel;
use dashmap::DashMap;
use tracing::debug;

use crate::rate::TrafficRate;

/// Rate updates buffered per subscriber before new ones are dropped.
pub const SUBSCRIBER_QUEUE: usize = 256;

pub struct Subscribers {
    // concurrent map so subscribe() never contends with the poll loop's broadcast
    senders: DashMap<u64, channel::Sender<TrafficRate>>,
    next_id: AtomicU64,
}

impl Subscribers {
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> channel::Receiver<TrafficRate> {
        self.subscribe_bounded(SUBSCRIBER_QUEUE)
    }

    pub fn subscribe_bounded(&self, capacity: usize) -> channel::Receiver<TrafficRate> {
        let (tx, rx) = channel::bounded(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders.insert(id, tx);
        rx
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn dispose(&self) {
        self.senders.clear();
    }

    pub fn broadcast(&self, rate: TrafficRate) {
        // Clone senders first so no shard lock is held while sending.
        let snapshot: Vec<(u64, channel::Sender<TrafficRate>)> =
            self.senders.iter().map(|e| (*e.key(), e.value().clone())).collect();

        let mut to_remove: Vec<u64> = Vec::new();
        for (id, tx) in snapshot.into_iter() {
            match tx.try_send(rate) {
                Ok(()) => {}
                Err(channel::TrySendError::Full(_)) => {
                    debug!(subscriber = id, "Subscriber queue full; dropping rate update");
                }
                Err(channel::TrySendError::Disconnected(_)) => {
                    to_remove.push(id);
                }
            }
        }

        for id in to_remove {
            self.senders.remove(&id);
        }
    }
}

impl Default for Subscribers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(v: u64) -> TrafficRate {
        TrafficRate { in_bytes_per_sec: v, out_bytes_per_sec: v / 2 }
    }

    #[test]
    fn broadcast_removes_dead_receivers() {
        let subs = Subscribers::new();
        let alive = subs.subscribe();
        let dead = subs.subscribe();
        drop(dead);

        subs.broadcast(rate(10));

        assert_eq!(alive.recv().unwrap(), rate(10));
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn full_receiver_misses_update_but_stays_subscribed() {
        let subs = Subscribers::new();
        let fast = subs.subscribe_bounded(1);
        let slow = subs.subscribe_bounded(1);

        subs.broadcast(rate(1));
        assert_eq!(fast.recv().unwrap(), rate(1));

        subs.broadcast(rate(2));
        assert_eq!(fast.recv().unwrap(), rate(2));
        assert_eq!(subs.len(), 2);

        assert_eq!(slow.recv().unwrap(), rate(1));
        assert!(slow.try_recv().is_err());
        subs.broadcast(rate(3));
        assert_eq!(slow.recv().unwrap(), rate(3));
    }

    #[test]
    fn broadcast_delivers_in_order_to_every_receiver() {
        let subs = Subscribers::new();
        let rx1 = subs.subscribe();
        let rx2 = subs.subscribe();

        for v in [5, 6, 7] {
            subs.broadcast(rate(v));
        }

        for rx in [rx1, rx2] {
            let got: Vec<TrafficRate> = rx.try_iter().collect();
            assert_eq!(got, vec![rate(5), rate(6), rate(7)]);
        }
    }

    #[test]
    fn dispose_disconnects_all_receivers() {
        let subs = Subscribers::new();
        let rx1 = subs.subscribe();
        let rx2 = subs.subscribe();

        subs.dispose();
        assert_eq!(subs.len(), 0);
        assert!(rx1.recv().is_err());
        assert!(rx2.recv().is_err());
    }
}
