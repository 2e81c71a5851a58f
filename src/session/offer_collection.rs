// src/session/offer_collection.rs
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::models::offer::DriverOffer;

/// Outcome of an `add`, so callers can tell a fresh card from a refresh of
/// one already on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferUpsert {
    Inserted,
    Updated,
}

/// Pending driver offers for one trip request, keyed by offer id with
/// insertion order preserved for display.
///
/// Re-pushed ids update in place instead of duplicating. Removing the last
/// entry signals closure exactly once per emptying; removing from an empty
/// collection is a no-op.
pub struct OfferCollection {
    entries: Mutex<Vec<DriverOffer>>,
    closed_tx: broadcast::Sender<()>,
}

impl OfferCollection {
    pub fn new() -> Self {
        let (closed_tx, _) = broadcast::channel(4);
        Self {
            entries: Mutex::new(Vec::new()),
            closed_tx,
        }
    }

    /// Fires once each time the collection goes from non-empty to empty.
    pub fn on_closed(&self) -> broadcast::Receiver<()> {
        self.closed_tx.subscribe()
    }

    pub fn add(&self, offer: DriverOffer) -> OfferUpsert {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.iter_mut().find(|entry| entry.id == offer.id) {
            *existing = offer;
            OfferUpsert::Updated
        } else {
            entries.push(offer);
            OfferUpsert::Inserted
        }
    }

    /// Removes the offer with `id`, returning whether it was present.
    pub fn remove(&self, id: i64) -> bool {
        let (removed, emptied) = {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            let removed = entries.len() != before;
            (removed, removed && entries.is_empty())
        };
        if emptied {
            let _ = self.closed_tx.send(());
        }
        removed
    }

    /// Drops every offer, signalling closure if any were present. Used when
    /// the owning session leaves its offer-collecting phase.
    pub fn clear(&self) -> usize {
        let drained = {
            let mut entries = self.entries.lock().unwrap();
            let count = entries.len();
            entries.clear();
            count
        };
        if drained > 0 {
            let _ = self.closed_tx.send(());
        }
        drained
    }

    pub fn get(&self, id: i64) -> Option<DriverOffer> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    pub fn first(&self) -> Option<DriverOffer> {
        self.entries.lock().unwrap().first().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Offers in arrival order, for rendering.
    pub fn snapshot(&self) -> Vec<DriverOffer> {
        self.entries.lock().unwrap().clone()
    }
}

impl Default for OfferCollection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::offer::{DriverSnapshot, VehicleSnapshot};

    fn offer(id: i64, fare: f64) -> DriverOffer {
        DriverOffer {
            id,
            trip_request_id: 42,
            driver_id: id * 10,
            fare_offered: fare,
            eta_minutes: 5,
            distance_km: 2.0,
            driver: DriverSnapshot {
                name: format!("driver-{}", id),
                rating: 4.5,
                total_trips: 100,
                vehicle: VehicleSnapshot {
                    make: "Kia".to_string(),
                    model: "Picanto".to_string(),
                    color: "blue".to_string(),
                    license_plate: format!("GR {}-25", 1000 + id),
                },
            },
        }
    }

    #[test]
    fn upsert_is_idempotent_on_id() {
        let collection = OfferCollection::new();
        assert_eq!(collection.add(offer(1, 15.0)), OfferUpsert::Inserted);
        assert_eq!(collection.add(offer(2, 18.0)), OfferUpsert::Inserted);
        assert_eq!(collection.len(), 2);

        // same id again: size unchanged, fields replaced
        assert_eq!(collection.add(offer(1, 17.5)), OfferUpsert::Updated);
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.get(1).unwrap().fare_offered, 17.5);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let collection = OfferCollection::new();
        collection.add(offer(5, 20.0));
        collection.add(offer(1, 15.0));
        collection.add(offer(3, 18.0));
        // updating must not move the entry
        collection.add(offer(1, 16.0));

        let ids: Vec<i64> = collection.snapshot().iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![5, 1, 3]);
        assert_eq!(collection.first().unwrap().id, 5);
    }

    #[test]
    fn removing_last_offer_signals_closure_once() {
        let collection = OfferCollection::new();
        let mut closed = collection.on_closed();

        collection.add(offer(1, 15.0));
        collection.add(offer(2, 18.0));

        assert!(collection.remove(1));
        assert!(closed.try_recv().is_err());

        assert!(collection.remove(2));
        assert!(closed.try_recv().is_ok());
        assert!(closed.try_recv().is_err());

        // removing from the already-empty collection is silent
        assert!(!collection.remove(2));
        assert!(closed.try_recv().is_err());
    }

    #[test]
    fn removing_unknown_id_is_a_noop() {
        let collection = OfferCollection::new();
        collection.add(offer(1, 15.0));
        let mut closed = collection.on_closed();

        assert!(!collection.remove(99));
        assert_eq!(collection.len(), 1);
        assert!(closed.try_recv().is_err());
    }

    #[test]
    fn clear_signals_closure_only_when_nonempty() {
        let collection = OfferCollection::new();
        let mut closed = collection.on_closed();

        assert_eq!(collection.clear(), 0);
        assert!(closed.try_recv().is_err());

        collection.add(offer(1, 15.0));
        assert_eq!(collection.clear(), 1);
        assert!(closed.try_recv().is_ok());
    }
}
