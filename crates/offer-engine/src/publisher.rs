//! `SwapOfferPublisher`: proof-of-work lifecycle and offer book access.
//!
//! All publish/withdraw calls for registered offers go through here. The
//! publisher remembers which payload is currently listed for each offer, so
//! a withdraw always names what is actually on the book and a republish of
//! an edited offer retires the payload it replaces.
//!
//! When the required difficulty rises past an offer's proof, the offer is
//! withdrawn, re-minted under the next mutation of its id and republished.
//! At most one redo task runs per offer; it keeps going until the offer's
//! proof satisfies the latest difficulty. A failed round ends the task and
//! leaves the offer for the next difficulty or offer-list event.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::events::OfferEvent;
use crate::offer::open_offer::{OpenOffer, OpenOfferState};
use crate::offer::payload::{OfferId, OfferPayload};
use crate::offer::registry::{OfferHandle, OfferRegistry};
use crate::ports::Ports;
use crate::pow::ProofOfWork;

pub struct SwapOfferPublisher {
    ports: Ports,
    registry: Arc<OfferRegistry>,
    maker_address: String,
    required_difficulty: AtomicU8,
    /// Payload currently on the book, per offer.
    listed: Mutex<HashMap<OfferHandle, OfferPayload>>,
    /// Offers with a running proof-of-work redo.
    in_flight: Mutex<HashSet<OfferHandle>>,
}

impl SwapOfferPublisher {
    pub fn new(
        ports: Ports,
        registry: Arc<OfferRegistry>,
        maker_address: String,
        initial_difficulty: u8,
    ) -> Self {
        Self {
            ports,
            registry,
            maker_address,
            required_difficulty: AtomicU8::new(initial_difficulty),
            listed: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn required_difficulty(&self) -> u8 {
        self.required_difficulty.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<OfferRegistry> {
        &self.registry
    }

    pub fn maker_address(&self) -> &str {
        &self.maker_address
    }

    /// Id of the payload currently listed for `handle`, if any.
    pub fn listed_id(&self, handle: OfferHandle) -> Result<Option<OfferId>> {
        Ok(self.listed()?.get(&handle).map(|p| p.id.clone()))
    }

    fn listed(&self) -> Result<MutexGuard<'_, HashMap<OfferHandle, OfferPayload>>> {
        self.listed.lock().map_err(|_| Error::LockPoisoned)
    }

    fn in_flight(&self) -> Result<MutexGuard<'_, HashSet<OfferHandle>>> {
        self.in_flight.lock().map_err(|_| Error::LockPoisoned)
    }

    fn proof_is_current(&self, payload: &OfferPayload) -> bool {
        if !payload.is_swap_offer() {
            return true;
        }
        payload.proof_of_work.is_some_and(|pow| {
            pow.satisfies(&payload.id, &payload.maker_address, self.required_difficulty())
        })
    }

    // ── Creation ────────────────────────────────────────────────────────

    /// Mint a proof of work for a fresh id at the current difficulty and
    /// hand both to `build`. The mint runs off the caller's thread.
    pub async fn request_new_offer<F>(&self, build: F) -> Result<OfferPayload>
    where
        F: FnOnce(OfferId, ProofOfWork) -> OfferPayload,
    {
        let id = OfferId::random();
        let difficulty = self.required_difficulty();
        let pow = self
            .ports
            .minter
            .mint(id.clone(), self.maker_address.clone(), difficulty)
            .await
            .map_err(Error::Minting)?;
        log::info!("publisher: minted proof for {id} at difficulty {difficulty}");
        Ok(build(id, pow))
    }

    /// List a registered offer. Offers that are not AVAILABLE stay off the
    /// book until they are activated. A swap offer whose proof fell behind
    /// the difficulty while it was minted is re-minted before listing.
    pub async fn place(self: &Arc<Self>, handle: OfferHandle) -> Result<bool> {
        let listed = {
            let _guard = self.registry.lock_offer(handle).await?;
            self.publish_current(handle).await?
        };
        if !listed && self.needs_redo(&self.registry.get(handle)?) {
            log::info!("publisher: difficulty rose while minting, re-minting before listing");
            self.start_redos()?;
        }
        Ok(listed)
    }

    // ── Book access ─────────────────────────────────────────────────────
    //
    // Callers hold the offer's lock from `OfferRegistry::lock_offer`.

    /// Make the book reflect the offer's current payload if it is
    /// AVAILABLE. Returns whether the offer is listed afterwards.
    pub(crate) async fn publish_current(&self, handle: OfferHandle) -> Result<bool> {
        let open = self.registry.get(handle)?;
        if !matches!(open.state(), OpenOfferState::Available) {
            return Ok(false);
        }
        let payload = open.offer();
        if !self.proof_is_current(payload) {
            log::debug!("publisher: holding back {} until its proof is re-minted", payload.id);
            return Ok(false);
        }
        let previous = self.listed()?.get(&handle).cloned();
        if let Some(previous) = previous {
            if previous == *payload {
                return Ok(true);
            }
            self.withdraw_payload(handle, previous).await?;
        }
        self.ports
            .offer_book
            .publish(payload.clone())
            .await
            .map_err(|e| {
                log::warn!("publisher: publish of {} failed: {e}", payload.id);
                Error::OfferBook(e)
            })?;
        self.listed()?.insert(handle, payload.clone());
        log::info!("publisher: published {}", payload.id);
        self.registry.emit(OfferEvent::Published {
            id: payload.id.clone(),
        });
        Ok(true)
    }

    /// Take whatever is listed for `handle` off the book. Returns whether
    /// anything was listed.
    pub(crate) async fn withdraw_current(&self, handle: OfferHandle) -> Result<bool> {
        let previous = self.listed()?.get(&handle).cloned();
        match previous {
            Some(payload) => {
                self.withdraw_payload(handle, payload).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn withdraw_payload(&self, handle: OfferHandle, payload: OfferPayload) -> Result<()> {
        let id = payload.id.clone();
        self.ports.offer_book.withdraw(payload).await.map_err(|e| {
            log::warn!("publisher: withdraw of {id} failed: {e}");
            Error::OfferBook(e)
        })?;
        self.listed()?.remove(&handle);
        log::info!("publisher: withdrew {id}");
        self.registry.emit(OfferEvent::Withdrawn { id });
        Ok(())
    }

    // ── Difficulty changes ──────────────────────────────────────────────

    /// Record a new required difficulty and start a redo for every live
    /// swap offer whose proof no longer satisfies it. Returns the tasks
    /// started by this call; offers with a redo already running are left to
    /// that task, which re-reads the difficulty after every mint.
    pub fn on_difficulty_changed(self: &Arc<Self>, difficulty: u8) -> Result<Vec<JoinHandle<()>>> {
        let previous = self.required_difficulty.swap(difficulty, Ordering::SeqCst);
        if difficulty != previous {
            log::info!("publisher: required difficulty {previous} -> {difficulty}");
        }
        self.start_redos()
    }

    /// Start a redo for every live swap offer that needs a fresh proof, or
    /// that is available but missing from the book after an earlier failed
    /// round. Does not change the required difficulty.
    pub fn start_redos(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let mut started = Vec::new();
        for (handle, open) in self.registry.live()? {
            if !self.needs_redo(&open) && !self.is_held_back(handle, &open)? {
                continue;
            }
            if !self.in_flight()?.insert(handle) {
                log::debug!("publisher: redo for {} already in flight", open.id());
                continue;
            }
            let publisher = Arc::clone(self);
            started.push(runtime.spawn(async move {
                publisher.run_redo(handle).await;
            }));
        }
        Ok(started)
    }

    fn needs_redo(&self, open: &OpenOffer) -> bool {
        open.offer().is_swap_offer()
            && matches!(
                open.state(),
                OpenOfferState::Available | OpenOfferState::Deactivated
            )
            && !self.proof_is_current(open.offer())
    }

    fn is_held_back(&self, handle: OfferHandle, open: &OpenOffer) -> Result<bool> {
        Ok(open.offer().is_swap_offer()
            && open.state() == OpenOfferState::Available
            && !self.listed()?.contains_key(&handle))
    }

    async fn run_redo(&self, handle: OfferHandle) {
        loop {
            if let Err(e) = self.redo_once(handle).await {
                log::warn!("publisher: proof-of-work redo failed, waiting for the next change: {e}");
                if let Ok(mut in_flight) = self.in_flight() {
                    in_flight.remove(&handle);
                }
                return;
            }
            // Decide under the in-flight lock so a difficulty change racing
            // with the exit either sees this task or starts a new one.
            let Ok(mut in_flight) = self.in_flight() else { return };
            let again = self
                .registry
                .get(handle)
                .map(|open| self.needs_redo(&open))
                .unwrap_or(false);
            if !again {
                in_flight.remove(&handle);
                return;
            }
        }
    }

    /// One withdraw, mint, swap, republish round.
    async fn redo_once(&self, handle: OfferHandle) -> Result<()> {
        let (open, generation) = {
            let _guard = self.registry.lock_offer(handle).await?;
            let open = self.registry.get(handle)?;
            if !self.needs_redo(&open) {
                self.publish_current(handle).await?;
                return Ok(());
            }
            let generation = self.registry.generation(handle)?;
            self.withdraw_current(handle).await?;
            (open, generation)
        };

        let old = open.id().clone();
        let new = old.next_mutation();
        let difficulty = self.required_difficulty();
        let pow = self
            .ports
            .minter
            .mint(new.clone(), self.maker_address.clone(), difficulty)
            .await
            .map_err(Error::Minting)?;

        let _guard = self.registry.lock_offer(handle).await?;
        let payload = open.offer().with_new_id(new.clone(), Some(pow));
        if !self.registry.swap_if_current(handle, generation, payload)? {
            log::info!("publisher: discarding proof for {new}, {old} changed while minting");
            return Ok(());
        }
        log::info!("publisher: {old} retired, re-minted as {new} at difficulty {difficulty}");
        self.registry.emit(OfferEvent::IdMutated {
            old,
            new,
            difficulty,
        });
        self.publish_current(handle).await?;
        Ok(())
    }
}
