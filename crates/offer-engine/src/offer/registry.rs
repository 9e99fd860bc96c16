//! Owned registry of open offers.
//!
//! Offers live in an arena addressed by a stable [`OfferHandle`]; a separate
//! index maps the current [`OfferId`] to its slot so the id can mutate
//! without invalidating handles held by watchers or in-flight mints.
//!
//! Closed and canceled offers leave the arena. Their final snapshot is kept
//! in a bounded retired list so late lookups still report the terminal
//! state; the oldest entries are forgotten first.
//!
//! Every lifecycle transition goes through the registry, which emits the
//! matching [`OfferEvent`] while still holding its lock. Events for one offer
//! therefore reach subscribers in the order the transitions happened.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{OwnedMutexGuard, broadcast};
use tokio::task::JoinHandle;

use crate::amount::Price;
use crate::error::{Error, Result};
use crate::events::{EVENT_CHANNEL_CAPACITY, OfferEvent};

use super::open_offer::{
    DeactivationReason, FeeValidationStatus, OpenOffer, OpenOfferState, StateChange,
};
use super::payload::{OfferId, OfferPayload};

/// Number of finished offers whose final snapshot stays queryable.
pub const RETIRED_CAPACITY: usize = 256;

/// Stable address of an open offer, valid across id mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OfferHandle(usize);

/// Hook run when a reservation times out, after the offer left RESERVED.
pub type ExpiryHook = Box<dyn FnOnce(OfferHandle, StateChange) + Send + 'static>;

struct Slot {
    open: OpenOffer,
    /// Bumped whenever the payload is replaced. Async work started against
    /// an older generation, or against an offer that has since retired, is
    /// stale.
    generation: u64,
    /// Bumped whenever the offer enters or leaves RESERVED.
    reservation_epoch: u64,
    timer: Option<JoinHandle<()>>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Slot {
    fn disarm(&mut self) {
        self.reservation_epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Final snapshot of a closed or canceled offer.
struct Retired {
    handle: OfferHandle,
    open: OpenOffer,
    lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Default)]
struct Slots {
    slots: BTreeMap<OfferHandle, Slot>,
    next: usize,
    by_id: HashMap<OfferId, OfferHandle>,
    retired: VecDeque<Retired>,
}

impl Slots {
    fn retired(&self, handle: OfferHandle) -> Option<&Retired> {
        self.retired.iter().find(|r| r.handle == handle)
    }

    fn missing(&self, handle: OfferHandle) -> Error {
        match self.retired(handle) {
            Some(retired) => Error::NotAvailable {
                state: retired.open.state(),
            },
            None => Error::OfferNotFound(format!("handle {}", handle.0)),
        }
    }

    fn slot(&self, handle: OfferHandle) -> Result<&Slot> {
        self.slots.get(&handle).ok_or_else(|| self.missing(handle))
    }

    fn slot_mut(&mut self, handle: OfferHandle) -> Result<&mut Slot> {
        if !self.slots.contains_key(&handle) {
            return Err(self.missing(handle));
        }
        self.slots
            .get_mut(&handle)
            .ok_or_else(|| Error::OfferNotFound(format!("handle {}", handle.0)))
    }

    fn snapshot(&self, handle: OfferHandle) -> Result<OpenOffer> {
        if let Some(slot) = self.slots.get(&handle) {
            return Ok(slot.open.clone());
        }
        self.retired(handle)
            .map(|r| r.open.clone())
            .ok_or_else(|| Error::OfferNotFound(format!("handle {}", handle.0)))
    }

    /// Move a finished offer out of the arena.
    fn retire(&mut self, handle: OfferHandle) {
        let Some(mut slot) = self.slots.remove(&handle) else {
            return;
        };
        slot.disarm();
        self.retired.push_back(Retired {
            handle,
            open: slot.open,
            lock: slot.lock,
        });
        while self.retired.len() > RETIRED_CAPACITY {
            let Some(oldest) = self.retired.pop_front() else {
                break;
            };
            if self.by_id.get(oldest.open.id()) == Some(&oldest.handle) {
                self.by_id.remove(oldest.open.id());
            }
        }
    }
}

pub struct OfferRegistry {
    slots: Mutex<Slots>,
    events: broadcast::Sender<OfferEvent>,
    reservation_timeout: Duration,
}

impl OfferRegistry {
    pub fn new(reservation_timeout: Duration) -> (Arc<Self>, broadcast::Receiver<OfferEvent>) {
        let (events, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(Self {
            slots: Mutex::new(Slots::default()),
            events,
            reservation_timeout,
        });
        (registry, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OfferEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slots>> {
        self.slots.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Send an event. Having no subscribers is not an error.
    pub(crate) fn emit(&self, event: OfferEvent) {
        let _ = self.events.send(event);
    }

    fn emit_change(&self, id: &OfferId, change: StateChange) {
        self.emit(OfferEvent::StateChanged {
            id: id.clone(),
            from: change.from,
            to: change.to,
        });
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    pub fn insert(&self, open: OpenOffer) -> Result<OfferHandle> {
        let mut slots = self.lock()?;
        if slots.by_id.contains_key(open.id()) {
            return Err(Error::DuplicateOffer(open.id().to_string()));
        }
        let handle = OfferHandle(slots.next);
        slots.next += 1;
        slots.by_id.insert(open.id().clone(), handle);
        log::debug!("registry: added {} in state {:?}", open.id(), open.state());
        slots.slots.insert(
            handle,
            Slot {
                open,
                generation: 0,
                reservation_epoch: 0,
                timer: None,
                lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        Ok(handle)
    }

    pub fn handle(&self, id: &OfferId) -> Result<OfferHandle> {
        self.lock()?
            .by_id
            .get(id)
            .copied()
            .ok_or_else(|| Error::OfferNotFound(id.to_string()))
    }

    /// Snapshot of the offer behind `handle`, retired ones included.
    pub fn get(&self, handle: OfferHandle) -> Result<OpenOffer> {
        self.lock()?.snapshot(handle)
    }

    pub fn get_by_id(&self, id: &OfferId) -> Result<OpenOffer> {
        let slots = self.lock()?;
        let handle = slots
            .by_id
            .get(id)
            .copied()
            .ok_or_else(|| Error::OfferNotFound(id.to_string()))?;
        slots.snapshot(handle)
    }

    /// Snapshots of every live offer followed by the retained finished ones.
    pub fn all(&self) -> Result<Vec<(OfferHandle, OpenOffer)>> {
        let slots = self.lock()?;
        let live = slots.slots.iter().map(|(h, slot)| (*h, slot.open.clone()));
        let retired = slots.retired.iter().map(|r| (r.handle, r.open.clone()));
        Ok(live.chain(retired).collect())
    }

    /// Snapshots of every offer not yet closed or canceled.
    pub fn live(&self) -> Result<Vec<(OfferHandle, OpenOffer)>> {
        Ok(self
            .lock()?
            .slots
            .iter()
            .map(|(h, slot)| (*h, slot.open.clone()))
            .collect())
    }

    pub fn generation(&self, handle: OfferHandle) -> Result<u64> {
        Ok(self.lock()?.slot(handle)?.generation)
    }

    /// Serialize book interactions for one offer. Callers hold the guard
    /// across a read of the offer and the publish/withdraw that follows.
    pub async fn lock_offer(&self, handle: OfferHandle) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let slots = self.lock()?;
            match (slots.slots.get(&handle), slots.retired(handle)) {
                (Some(slot), _) => slot.lock.clone(),
                (None, Some(retired)) => retired.lock.clone(),
                (None, None) => return Err(Error::OfferNotFound(format!("handle {}", handle.0))),
            }
        };
        Ok(lock.lock_owned().await)
    }

    // ── Deactivation reasons ────────────────────────────────────────────

    /// Record `reason` against the offer.
    pub fn deactivate(
        &self,
        handle: OfferHandle,
        reason: DeactivationReason,
    ) -> Result<Option<StateChange>> {
        let mut slots = self.lock()?;
        let slot = slots.slot_mut(handle)?;
        let change = slot.open.deactivate(reason)?;
        let id = slot.open.id().clone();
        match change {
            Some(change) => {
                log::info!("registry: {id} deactivated: {}", reason.describe());
                self.emit_change(&id, change);
                if change.became_deactivated() {
                    self.emit(OfferEvent::Deactivated {
                        id,
                        reason,
                        message: reason.describe().to_string(),
                    });
                }
            }
            None => log::debug!("registry: {id} recorded {reason:?} without a state change"),
        }
        Ok(change)
    }

    /// Clear `reason`. The offer only becomes available once no reason is
    /// left.
    pub fn clear_reason(
        &self,
        handle: OfferHandle,
        reason: DeactivationReason,
    ) -> Result<Option<StateChange>> {
        let mut slots = self.lock()?;
        let slot = slots.slot_mut(handle)?;
        let change = slot.open.clear_reason(reason)?;
        let id = slot.open.id().clone();
        match change {
            Some(change) => {
                log::info!("registry: {id} reactivated after clearing {reason:?}");
                self.emit_change(&id, change);
                if change.became_available() {
                    self.emit(OfferEvent::Activated { id });
                }
            }
            None => log::debug!("registry: {id} cleared {reason:?} without a state change"),
        }
        Ok(change)
    }

    // ── Reservation ─────────────────────────────────────────────────────

    /// Move an available offer to RESERVED and arm the reservation timer.
    ///
    /// If the timer fires before [`close`](Self::close) or
    /// [`release`](Self::release), the offer returns to its resting state
    /// and `on_expiry` runs with the resulting edge.
    pub fn reserve(
        self: &Arc<Self>,
        handle: OfferHandle,
        on_expiry: Option<ExpiryHook>,
    ) -> Result<StateChange> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let mut slots = self.lock()?;
        let slot = slots.slot_mut(handle)?;
        let change = slot.open.reserve()?;
        slot.disarm();
        let epoch = slot.reservation_epoch;
        let weak: Weak<Self> = Arc::downgrade(self);
        let timeout = self.reservation_timeout;
        slot.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(registry) = weak.upgrade() else { return };
            match registry.expire(handle, epoch) {
                Ok(Some(change)) => {
                    if let Some(hook) = on_expiry {
                        hook(handle, change);
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("registry: reservation expiry failed: {e}"),
            }
        }));
        let id = slot.open.id().clone();
        log::info!("registry: {id} reserved for {timeout:?}");
        self.emit_change(&id, change);
        Ok(change)
    }

    /// Timer callback. A no-op unless the reservation that armed the timer
    /// is still the current one.
    fn expire(&self, handle: OfferHandle, epoch: u64) -> Result<Option<StateChange>> {
        let mut slots = self.lock()?;
        let Some(slot) = slots.slots.get_mut(&handle) else {
            return Ok(None);
        };
        if slot.reservation_epoch != epoch || slot.open.state() != OpenOfferState::Reserved {
            return Ok(None);
        }
        let change = slot.open.release()?;
        slot.timer = None;
        slot.reservation_epoch += 1;
        let id = slot.open.id().clone();
        log::info!("registry: reservation of {id} timed out, back to {:?}", change.to);
        self.emit_change(&id, change);
        Ok(Some(change))
    }

    /// Taker aborted: leave RESERVED without settling.
    pub fn release(&self, handle: OfferHandle) -> Result<StateChange> {
        let mut slots = self.lock()?;
        let slot = slots.slot_mut(handle)?;
        let change = slot.open.release()?;
        slot.disarm();
        let id = slot.open.id().clone();
        log::info!("registry: reservation of {id} released");
        self.emit_change(&id, change);
        Ok(change)
    }

    /// Settlement completed.
    pub fn close(&self, handle: OfferHandle) -> Result<StateChange> {
        let mut slots = self.lock()?;
        let slot = slots.slot_mut(handle)?;
        let change = slot.open.close()?;
        let id = slot.open.id().clone();
        slots.retire(handle);
        log::info!("registry: {id} closed");
        self.emit_change(&id, change);
        Ok(change)
    }

    pub fn cancel(&self, handle: OfferHandle) -> Result<StateChange> {
        let mut slots = self.lock()?;
        let slot = slots.slot_mut(handle)?;
        let change = slot.open.cancel()?;
        let id = slot.open.id().clone();
        slots.retire(handle);
        log::info!("registry: {id} canceled");
        self.emit_change(&id, change);
        Ok(change)
    }

    // ── Payload & local fields ──────────────────────────────────────────

    /// Replace the payload of a resting offer, keeping its id. Invalidates
    /// async work started against the previous payload.
    pub fn replace_offer(&self, handle: OfferHandle, payload: OfferPayload, trigger_price: Price) -> Result<u64> {
        let mut slots = self.lock()?;
        let slot = slots.slot_mut(handle)?;
        match slot.open.state() {
            OpenOfferState::Available | OpenOfferState::Deactivated => {}
            state => return Err(Error::NotAvailable { state }),
        }
        if payload.id != *slot.open.id() {
            return Err(Error::OfferNotFound(payload.id.to_string()));
        }
        slot.open.replace_offer(payload);
        slot.open.set_trigger_price(trigger_price);
        slot.generation += 1;
        Ok(slot.generation)
    }

    /// Swap in a re-minted payload under a new id, but only if nothing
    /// touched the offer since `expected_generation` was read. Returns
    /// whether the swap happened.
    pub fn swap_if_current(
        &self,
        handle: OfferHandle,
        expected_generation: u64,
        payload: OfferPayload,
    ) -> Result<bool> {
        let mut slots = self.lock()?;
        let Some(slot) = slots.slots.get(&handle) else {
            return Ok(false);
        };
        if slot.generation != expected_generation {
            return Ok(false);
        }
        if slots.by_id.contains_key(&payload.id) {
            return Err(Error::DuplicateOffer(payload.id.to_string()));
        }
        let old = slot.open.id().clone();
        let new = payload.id.clone();
        slots.by_id.remove(&old);
        slots.by_id.insert(new, handle);
        let slot = slots.slot_mut(handle)?;
        slot.open.replace_offer(payload);
        slot.generation += 1;
        Ok(true)
    }

    pub fn set_trigger_price(&self, handle: OfferHandle, trigger_price: Price) -> Result<()> {
        let mut slots = self.lock()?;
        slots.slot_mut(handle)?.open.set_trigger_price(trigger_price);
        Ok(())
    }

    pub fn set_fee_validation_status(&self, handle: OfferHandle, status: FeeValidationStatus) -> Result<()> {
        let mut slots = self.lock()?;
        let slot = slots.slot_mut(handle)?;
        if slot.open.fee_validation_status() == status {
            return Ok(());
        }
        slot.open.set_fee_validation_status(status);
        let id = slot.open.id().clone();
        log::debug!("registry: {id} fee validation {status:?}");
        self.emit(OfferEvent::FeeValidated { id, status });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{drain_events, sample_offer};

    use DeactivationReason::*;
    use OpenOfferState::*;

    fn registry() -> (Arc<OfferRegistry>, broadcast::Receiver<OfferEvent>, OfferHandle) {
        let (registry, rx) = OfferRegistry::new(Duration::from_secs(60));
        let offer = sample_offer();
        let trigger = Price::zero(offer.counter_currency.clone());
        let handle = registry.insert(OpenOffer::new(offer, trigger)).unwrap();
        (registry, rx, handle)
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let (registry, _rx, _) = registry();
        let offer = sample_offer();
        let trigger = Price::zero(offer.counter_currency.clone());
        let err = registry.insert(OpenOffer::new(offer, trigger)).unwrap_err();
        assert!(matches!(err, Error::DuplicateOffer(_)));
    }

    #[test]
    fn deactivation_emits_cause() {
        let (registry, mut rx, h) = registry();
        registry.deactivate(h, TriggerPrice).unwrap();
        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 2);
        match &events[1] {
            OfferEvent::Deactivated { reason, message, .. } => {
                assert_eq!(*reason, TriggerPrice);
                assert!(message.contains("trigger price"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Second reason: recorded, no new events.
        assert_eq!(registry.deactivate(h, User).unwrap(), None);
        assert!(drain_events(&mut rx).is_empty());
    }

    #[test]
    fn reserve_needs_a_runtime() {
        let (registry, _rx, h) = registry();
        assert_eq!(registry.reserve(h, None).unwrap_err(), Error::NoRuntime);
        assert_eq!(registry.get(h).unwrap().state(), Available);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_times_out_once() {
        let (registry, _rx, h) = registry();
        registry.reserve(h, None).unwrap();
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(registry.get(h).unwrap().state(), Reserved);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.get(h).unwrap().state(), Available);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_offer_is_not_reset_by_stale_timer() {
        let (registry, _rx, h) = registry();
        registry.reserve(h, None).unwrap();
        registry.close(h).unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(registry.get(h).unwrap().state(), Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn rereserving_rearms_the_timer() {
        let (registry, _rx, h) = registry();
        registry.reserve(h, None).unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        registry.release(h).unwrap();
        registry.reserve(h, None).unwrap();
        // The first timer would have fired at t=60.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(registry.get(h).unwrap().state(), Reserved);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.get(h).unwrap().state(), Available);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_hook_sees_deferred_reason() {
        let (registry, _rx, h) = registry();
        let (tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
        registry
            .reserve(
                h,
                Some(Box::new(move |_, change| {
                    let _ = tx.send(change);
                })),
            )
            .unwrap();
        registry.deactivate(h, MissingFunds).unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        let change = seen.recv().await.unwrap();
        assert_eq!(change, StateChange { from: Reserved, to: Deactivated });
    }

    #[test]
    fn swap_if_current_moves_the_id_index() {
        let (registry, _rx, h) = registry();
        let open = registry.get(h).unwrap();
        let generation = registry.generation(h).unwrap();
        let next = open.offer().with_new_id(open.id().next_mutation(), None);
        assert!(registry.swap_if_current(h, generation, next.clone()).unwrap());
        assert_eq!(registry.handle(&next.id).unwrap(), h);
        assert!(registry.handle(open.id()).is_err());

        // Stale generation is refused.
        let again = next.with_new_id(next.id.next_mutation(), None);
        assert!(!registry.swap_if_current(h, generation, again).unwrap());
    }

    #[test]
    fn cancel_invalidates_pending_swaps() {
        let (registry, _rx, h) = registry();
        let generation = registry.generation(h).unwrap();
        registry.cancel(h).unwrap();
        let open = registry.get(h).unwrap();
        let next = open.offer().with_new_id(open.id().next_mutation(), None);
        assert!(!registry.swap_if_current(h, generation, next).unwrap());
    }

    #[test]
    fn finished_offers_leave_the_live_set() {
        let (registry, _rx, h) = registry();
        registry.cancel(h).unwrap();
        assert!(registry.live().unwrap().is_empty());
        assert_eq!(registry.get(h).unwrap().state(), Canceled);
        assert_eq!(
            registry.deactivate(h, User).unwrap_err(),
            Error::NotAvailable { state: Canceled }
        );
    }

    #[test]
    fn oldest_retired_offers_are_forgotten() {
        let (registry, _rx, first) = registry();
        let first_id = registry.get(first).unwrap().id().clone();
        registry.cancel(first).unwrap();
        let mut last = first;
        for i in 0..RETIRED_CAPACITY {
            let mut offer = sample_offer();
            offer.id = format!("retired-{i}").parse().unwrap();
            let trigger = Price::zero(offer.counter_currency.clone());
            last = registry.insert(OpenOffer::new(offer, trigger)).unwrap();
            registry.cancel(last).unwrap();
        }
        assert!(matches!(registry.get(first), Err(Error::OfferNotFound(_))));
        assert!(matches!(registry.handle(&first_id), Err(Error::OfferNotFound(_))));
        assert_eq!(registry.get(last).unwrap().state(), Canceled);
        assert_eq!(registry.all().unwrap().len(), RETIRED_CAPACITY);
    }

    #[tokio::test]
    async fn offer_lock_is_exclusive() {
        let (registry, _rx, h) = registry();
        let guard = registry.lock_offer(h).await.unwrap();
        let second = registry.clone();
        let waiter = tokio::spawn(async move { second.lock_offer(h).await.map(|_| ()) });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap().unwrap();
    }
}
