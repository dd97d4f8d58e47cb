// Broadcast hub: one producer, N subscribers, never blocking the
// producer. Subscribe is atomic with respect to publish so a late
// joiner's prefill always precedes its first live unit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::stream::gop::GopCache;
use crate::stream::nal::{H264Unit, UnitKind};

/// A stream consumer's end of the hub.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<H264Unit>,
    /// Units enqueued from the GOP cache before any live unit.
    pub prefill_len: usize,
    /// True when this subscribe moved the count 0 -> 1.
    pub was_first: bool,
}

struct SubscriberEntry {
    tx: mpsc::Sender<H264Unit>,
    drop_count: u64,
    joined_at: Instant,
    /// A subscriber that joined without a prefill receives nothing until
    /// the GOP cache reseeds at an IDR; then it gets the fresh GOP head.
    primed: bool,
}

struct HubInner {
    gop: GopCache,
    subscribers: HashMap<u64, SubscriberEntry>,
    next_id: u64,
    units_broadcast: u64,
}

/// Per-subscriber counters for the metrics surface.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub subscriber_id: u64,
    pub drop_count: u64,
    pub connected_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HubStats {
    pub subscriber_count: usize,
    pub units_broadcast: u64,
    pub subscribers: Vec<SubscriberStats>,
    pub last_idr_at: Option<Instant>,
    pub awaiting_idr: bool,
}

pub struct BroadcastHub {
    queue_depth: usize,
    inner: Mutex<HubInner>,
}

impl BroadcastHub {
    pub fn new(queue_depth: usize, gop_cap_bytes: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            inner: Mutex::new(HubInner {
                gop: GopCache::new(gop_cap_bytes),
                subscribers: HashMap::new(),
                next_id: 1,
                units_broadcast: 0,
            }),
        }
    }

    /// Register a new subscriber. Under the hub lock: snapshot the GOP
    /// cache, create the bounded queue, enqueue the prefill, register.
    /// The queue is sized `prefill + queue_depth`, so the prefill cannot
    /// overflow and live headroom is exactly `queue_depth`.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        let prefill = inner.gop.snapshot_prefill();
        let (tx, rx) = mpsc::channel(prefill.len() + self.queue_depth);
        let prefill_len = prefill.len();
        for unit in prefill {
            // Freshly created queue with reserved prefill capacity.
            let _ = tx.try_send(unit);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            SubscriberEntry {
                tx,
                drop_count: 0,
                joined_at: Instant::now(),
                primed: prefill_len > 0,
            },
        );
        let was_first = inner.subscribers.len() == 1;
        debug!(subscriber_id = id, prefill_len, "subscriber joined");
        Subscription {
            id,
            rx,
            prefill_len,
            was_first,
        }
    }

    /// Remove a subscriber and close its queue. Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.subscribers.remove(&id).is_some() {
            debug!(subscriber_id = id, "subscriber left");
        }
    }

    /// Fan one unit out to every subscriber. Non-blocking: a full queue
    /// costs that subscriber the unit and bumps its drop counter; a
    /// closed queue deregisters the subscriber. Unprimed subscribers are
    /// skipped until an IDR reseeds the GOP cache, at which point they
    /// receive the whole fresh GOP head (so their first units are always
    /// SPS, PPS, ..., IDR).
    pub fn publish(&self, unit: H264Unit) {
        let mut inner = self.inner.lock().unwrap();
        inner.gop.update(&unit);
        inner.units_broadcast += 1;

        let reseeded = unit.kind == UnitKind::Idr && !inner.gop.is_empty();
        let gop_head = if reseeded && inner.subscribers.values().any(|s| !s.primed) {
            inner.gop.snapshot_prefill()
        } else {
            Vec::new()
        };

        let mut closed = Vec::new();
        for (id, entry) in inner.subscribers.iter_mut() {
            if !entry.primed {
                if reseeded {
                    // The GOP head ends with this IDR; no double send.
                    for cached in &gop_head {
                        match entry.tx.try_send(cached.clone()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => entry.drop_count += 1,
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                closed.push(*id);
                                break;
                            }
                        }
                    }
                    entry.primed = true;
                } else if entry.tx.is_closed() {
                    closed.push(*id);
                }
                continue;
            }
            match entry.tx.try_send(unit.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.drop_count += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*id);
                }
            }
        }
        for id in closed {
            inner.subscribers.remove(&id);
            debug!(subscriber_id = id, "subscriber queue closed, removed");
        }
    }

    /// Close every subscriber queue (worker shutdown).
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.clear();
    }

    /// Drop cached GOP state (encoder restart / config change).
    pub fn reset_gop(&self) {
        self.inner.lock().unwrap().gop.reset();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    /// How long the GOP cache has been continuously empty.
    pub fn gop_empty_for(&self) -> Option<Duration> {
        self.inner.lock().unwrap().gop.empty_for()
    }

    pub fn stats(&self) -> HubStats {
        let inner = self.inner.lock().unwrap();
        HubStats {
            subscriber_count: inner.subscribers.len(),
            units_broadcast: inner.units_broadcast,
            subscribers: inner
                .subscribers
                .iter()
                .map(|(id, e)| SubscriberStats {
                    subscriber_id: *id,
                    drop_count: e.drop_count,
                    connected_secs: e.joined_at.elapsed().as_secs(),
                })
                .collect(),
            last_idr_at: inner.gop.last_idr_at(),
            awaiting_idr: inner.gop.awaiting_idr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::nal::UnitKind;
    use bytes::Bytes;

    fn unit(kind: UnitKind, tag: u8) -> H264Unit {
        let nal_type = match kind {
            UnitKind::Sps => 7,
            UnitKind::Pps => 8,
            UnitKind::Aud => 9,
            UnitKind::Sei => 6,
            UnitKind::Idr => 5,
            UnitKind::NonIdr => 1,
            UnitKind::Other => 12,
        };
        H264Unit {
            kind,
            bytes: Bytes::from(vec![0, 0, 0, 1, nal_type, tag]),
            generated_at: Instant::now(),
        }
    }

    fn tag(u: &H264Unit) -> u8 {
        u.bytes[5]
    }

    #[tokio::test]
    async fn prefill_is_empty_before_first_idr() {
        // Scenario S1: a pre-IDR joiner sees nothing until the first
        // SPS+PPS+IDR sequence lands, then exactly that sequence.
        let hub = BroadcastHub::new(256, 1 << 20);
        hub.publish(unit(UnitKind::NonIdr, 0));

        let mut sub = hub.subscribe();
        assert_eq!(sub.prefill_len, 0);
        assert!(sub.rx.try_recv().is_err());

        // Pre-IDR noise after joining is withheld too.
        hub.publish(unit(UnitKind::NonIdr, 9));
        assert!(sub.rx.try_recv().is_err());

        hub.publish(unit(UnitKind::Sps, 1));
        hub.publish(unit(UnitKind::Pps, 2));
        assert!(sub.rx.try_recv().is_err(), "no messages until the IDR");
        hub.publish(unit(UnitKind::Idr, 3));
        hub.publish(unit(UnitKind::NonIdr, 4));

        for expected in [1u8, 2, 3, 4] {
            let u = sub.rx.recv().await.unwrap();
            assert_eq!(tag(&u), expected);
        }
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_joiner_gets_cached_gop_then_live() {
        // Scenario S2: subscribe after SPS,PPS,IDR,P1,P2,P3; prefill is
        // exactly that sequence, then live units follow in order.
        let hub = BroadcastHub::new(256, 1 << 20);
        for (k, t) in [
            (UnitKind::Sps, 0u8),
            (UnitKind::Pps, 1),
            (UnitKind::Idr, 2),
            (UnitKind::NonIdr, 3),
            (UnitKind::NonIdr, 4),
            (UnitKind::NonIdr, 5),
        ] {
            hub.publish(unit(k, t));
        }

        let mut sub = hub.subscribe();
        assert_eq!(sub.prefill_len, 6);

        hub.publish(unit(UnitKind::NonIdr, 6));

        for expected in 0u8..=6 {
            let u = sub.rx.recv().await.unwrap();
            assert_eq!(tag(&u), expected, "prefill precedes live, in order");
        }
        assert!(sub.rx.try_recv().is_err());
    }

    /// Establish a minimal GOP so later joiners arrive primed.
    fn seed_gop(hub: &BroadcastHub) {
        hub.publish(unit(UnitKind::Sps, 0));
        hub.publish(unit(UnitKind::Pps, 1));
        hub.publish(unit(UnitKind::Idr, 2));
    }

    #[tokio::test]
    async fn sps_change_resets_the_prefill() {
        // Scenario S3: after SPS0,PPS0,IDR0,P1,SPS1,PPS1,IDR1,P2 a new
        // joiner gets exactly SPS1,PPS1,IDR1,P2 and then live.
        let hub = BroadcastHub::new(256, 1 << 20);
        for (k, t) in [
            (UnitKind::Sps, 0u8),
            (UnitKind::Pps, 1),
            (UnitKind::Idr, 2),
            (UnitKind::NonIdr, 3),
            (UnitKind::Sps, 10),
            (UnitKind::Pps, 11),
            (UnitKind::Idr, 12),
            (UnitKind::NonIdr, 13),
        ] {
            hub.publish(unit(k, t));
        }

        let mut sub = hub.subscribe();
        assert_eq!(sub.prefill_len, 4);
        hub.publish(unit(UnitKind::NonIdr, 14));

        for expected in [10u8, 11, 12, 13, 14] {
            assert_eq!(tag(&sub.rx.recv().await.unwrap()), expected);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_do_not_affect_others() {
        // Scenario S4: queue depth 4, 100 published units, nothing
        // drained: 96 drops, subscriber still registered.
        let hub = BroadcastHub::new(4, 1 << 20);
        seed_gop(&hub);
        let slow = hub.subscribe(); // prefill 3, live headroom 4
        let mut fast = hub.subscribe();

        for i in 0..100u8 {
            hub.publish(unit(UnitKind::NonIdr, i));
            // The fast subscriber drains as it goes.
            while fast.rx.try_recv().is_ok() {}
        }

        let stats = hub.stats();
        assert_eq!(stats.subscriber_count, 2);
        let slow_stats = stats
            .subscribers
            .iter()
            .find(|s| s.subscriber_id == slow.id)
            .unwrap();
        assert_eq!(slow_stats.drop_count, 96);
        let fast_stats = stats
            .subscribers
            .iter()
            .find(|s| s.subscriber_id == fast.id)
            .unwrap();
        assert_eq!(fast_stats.drop_count, 0);
    }

    #[tokio::test]
    async fn non_dropped_units_preserve_order() {
        let hub = BroadcastHub::new(4, 1 << 20);
        seed_gop(&hub);
        let mut sub = hub.subscribe();
        for i in 10..110u8 {
            hub.publish(unit(UnitKind::NonIdr, i));
        }
        let mut last = None;
        let mut received = 0;
        while let Ok(u) = sub.rx.try_recv() {
            let t = tag(&u);
            if let Some(prev) = last {
                assert!(t > prev);
            }
            last = Some(t);
            received += 1;
        }
        // 3 prefill units plus the live headroom.
        assert_eq!(received, 7);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_closes_queue() {
        let hub = BroadcastHub::new(4, 1 << 20);
        let mut sub = hub.subscribe();
        hub.unsubscribe(sub.id);
        hub.unsubscribe(sub.id);
        assert_eq!(hub.subscriber_count(), 0);
        assert!(sub.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_is_reaped_on_publish() {
        let hub = BroadcastHub::new(4, 1 << 20);
        let sub = hub.subscribe();
        drop(sub.rx);
        hub.publish(unit(UnitKind::NonIdr, 0));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_all_wakes_receivers() {
        let hub = BroadcastHub::new(4, 1 << 20);
        let mut sub = hub.subscribe();
        hub.close_all();
        assert!(sub.rx.recv().await.is_none());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn was_first_tracks_zero_to_one() {
        let hub = BroadcastHub::new(4, 1 << 20);
        let first = hub.subscribe();
        assert!(first.was_first);
        let second = hub.subscribe();
        assert!(!second.was_first);
        hub.unsubscribe(first.id);
        hub.unsubscribe(second.id);
        let again = hub.subscribe();
        assert!(again.was_first);
    }

    #[tokio::test]
    async fn prefill_larger_than_queue_depth_fits() {
        // The prefill gets reserved capacity beyond queue_depth, so a
        // long GOP still arrives complete.
        let hub = BroadcastHub::new(2, 1 << 20);
        hub.publish(unit(UnitKind::Sps, 0));
        hub.publish(unit(UnitKind::Pps, 1));
        hub.publish(unit(UnitKind::Idr, 2));
        for i in 3..10u8 {
            hub.publish(unit(UnitKind::NonIdr, i));
        }
        let mut sub = hub.subscribe();
        assert_eq!(sub.prefill_len, 10);
        for expected in 0u8..10 {
            assert_eq!(tag(&sub.rx.recv().await.unwrap()), expected);
        }
        let stats = hub.stats();
        assert_eq!(stats.subscribers[0].drop_count, 0);
    }
}
