//! The marketplace state machine.
//!
//! [`Marketplace`] wires requests, slots, collateral and proofs together.
//! Every mutating entry point runs inside [`Marketplace::transact`]: either
//! the whole call takes effect, or none of it does. Rollback restores only
//! the records the entry point declares it may touch. Token transfers are the last
//! fallible step of each entry point, so a failed transfer never leaves funds
//! moved while bookkeeping is rolled back.

use cask_token::{Address, Amount, InMemoryToken, TokenLedger};
use tracing::{debug, info, warn};

use crate::clock::{Clock, ManualClock};
use crate::collateral::{CollateralCheckpoint, CollateralLedger, CollateralTotals};
use crate::config::MarketConfig;
use crate::error::{MarketError, Result};
use crate::events::MarketEvent;
use crate::funds::{FundsCheck, MarketplaceFunds};
use crate::ids::{RequestId, SlotId};
use crate::proofs::{ProofSystem, SimulatedProofs};
use crate::requests::{Request, RequestCheckpoint, RequestContext, RequestRegistry, RequestState};
use crate::slots::{Slot, SlotCheckpoint, SlotRegistry, SlotState};

/// Label of the custody account used by [`SimulatedMarketplace::simulated`].
pub const SIMULATED_CUSTODY: &str = "cask-custody";

/// Everything an entry point may change.
#[derive(Debug, Default)]
struct MarketState {
    requests: RequestRegistry,
    slots: SlotRegistry,
    collateral: CollateralLedger,
    funds: MarketplaceFunds,
}

/// Records an entry point may touch.
///
/// Escrow counters and collateral totals are always captured.
#[derive(Debug, Default)]
struct Scope {
    request: Option<RequestId>,
    slot: Option<SlotId>,
    hosts: Vec<Address>,
}

impl Scope {
    fn request(request_id: RequestId) -> Self {
        Self {
            request: Some(request_id),
            ..Self::default()
        }
    }

    fn host(host: Address) -> Self {
        Self {
            hosts: vec![host],
            ..Self::default()
        }
    }
}

/// Scoped state captured on entry, restored on error.
#[derive(Debug)]
struct Checkpoint<K> {
    request: Option<RequestCheckpoint>,
    slot: Option<(SlotCheckpoint, K)>,
    collateral: CollateralCheckpoint,
    funds: MarketplaceFunds,
}

/// Storage marketplace over a token ledger, a proof system and a clock.
#[derive(Debug)]
pub struct Marketplace<T, P, C> {
    config: MarketConfig,
    custody: Address,
    token: T,
    proofs: P,
    clock: C,
    state: MarketState,
    events: Vec<MarketEvent>,
}

/// Marketplace over in-memory collaborators.
pub type SimulatedMarketplace = Marketplace<InMemoryToken, SimulatedProofs, ManualClock>;

impl SimulatedMarketplace {
    /// Marketplace with a fresh [`InMemoryToken`], [`SimulatedProofs`] and
    /// the given clock.
    pub fn simulated(config: MarketConfig, clock: ManualClock) -> Result<Self> {
        Self::new(
            config,
            Address::from_label(SIMULATED_CUSTODY),
            InMemoryToken::new(),
            SimulatedProofs::new(config.proofs),
            clock,
        )
    }
}

impl<T, P, C> Marketplace<T, P, C>
where
    T: TokenLedger,
    P: ProofSystem,
    C: Clock,
{
    /// Create a marketplace holding funds in `custody`.
    pub fn new(config: MarketConfig, custody: Address, token: T, proofs: P, clock: C) -> Result<Self> {
        config.validate()?;
        info!(custody = %custody, "marketplace created");
        Ok(Self {
            config,
            custody,
            token,
            proofs,
            clock,
            state: MarketState::default(),
            events: Vec::new(),
        })
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Active configuration.
    pub const fn config(&self) -> &MarketConfig {
        &self.config
    }

    /// Account holding escrow and collateral.
    pub const fn custody(&self) -> &Address {
        &self.custody
    }

    /// Token ledger.
    pub const fn token(&self) -> &T {
        &self.token
    }

    /// Mutable token ledger, for funding accounts outside the marketplace.
    pub fn token_mut(&mut self) -> &mut T {
        &mut self.token
    }

    /// Proof system.
    pub const fn proofs(&self) -> &P {
        &self.proofs
    }

    /// Clock.
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    /// Committed events, oldest first.
    pub fn events(&self) -> &[MarketEvent] {
        &self.events
    }

    /// Takes the committed events.
    pub fn drain_events(&mut self) -> Vec<MarketEvent> {
        std::mem::take(&mut self.events)
    }

    /// Escrow counters.
    pub const fn funds(&self) -> MarketplaceFunds {
        self.state.funds
    }

    /// Collateral totals.
    pub const fn collateral_totals(&self) -> CollateralTotals {
        self.state.collateral.totals()
    }

    /// Collateral held for `account`.
    pub fn balance_of(&self, account: &Address) -> Amount {
        self.state.collateral.balance_of(account)
    }

    /// Collateral ledger.
    pub const fn collateral(&self) -> &CollateralLedger {
        &self.state.collateral
    }

    // ---------------------------------------------------------------------
    // Views
    // ---------------------------------------------------------------------

    /// A submitted request.
    pub fn request(&self, request_id: &RequestId) -> Result<&Request> {
        self.state.requests.request(request_id)
    }

    /// Stored context of a request.
    pub fn request_context(&self, request_id: &RequestId) -> Result<&RequestContext> {
        self.state.requests.context(request_id)
    }

    /// Observable request state.
    pub fn request_state(&self, request_id: &RequestId) -> Result<RequestState> {
        self.state
            .requests
            .computed_state(request_id, self.clock.now())
    }

    /// Observable end of storage.
    pub fn request_end(&self, request_id: &RequestId) -> Result<u64> {
        self.state.requests.end(request_id, self.clock.now())
    }

    /// Stored slot record, if a host is linked.
    pub fn slot(&self, slot_id: &SlotId) -> Option<&Slot> {
        self.state.slots.get(slot_id)
    }

    /// Observable slot state.
    pub fn slot_state(&self, slot_id: &SlotId) -> Result<SlotState> {
        self.state
            .slots
            .state(slot_id, &self.state.requests, self.clock.now())
    }

    /// Slots `host` currently backs.
    pub fn active_slots(&self, host: &Address) -> Vec<SlotId> {
        self.state.slots.active_slots(host)
    }

    /// Proofs missed for a slot since it was filled.
    pub fn missing_proofs(&self, slot_id: &SlotId) -> u64 {
        self.proofs.missing_proofs(slot_id)
    }

    /// Whether the host of a filled slot owes a proof this period.
    pub fn is_proof_required(&self, slot_id: &SlotId) -> bool {
        matches!(self.slot_state(slot_id), Ok(SlotState::Filled))
            && self.proofs.is_proof_required(slot_id, self.clock.now())
    }

    // ---------------------------------------------------------------------
    // Collateral
    // ---------------------------------------------------------------------

    /// Deposits collateral for `caller`.
    pub fn deposit_collateral(&mut self, caller: &Address, amount: Amount) -> Result<()> {
        self.transact("deposit_collateral", Scope::host(*caller), |market, events| {
            market
                .state
                .collateral
                .deposit(&mut market.token, &market.custody, caller, amount)?;
            events.push(MarketEvent::CollateralDeposited {
                account: *caller,
                amount,
            });
            Ok(())
        })
    }

    /// Withdraws all of `caller`'s collateral. Locked while the caller backs
    /// any slot.
    pub fn withdraw_collateral(&mut self, caller: &Address) -> Result<Amount> {
        self.transact("withdraw_collateral", Scope::host(*caller), |market, events| {
            let amount = market.state.collateral.withdraw(
                &mut market.token,
                &market.custody,
                caller,
                &market.state.slots,
            )?;
            events.push(MarketEvent::CollateralWithdrawn {
                account: *caller,
                amount,
            });
            Ok(amount)
        })
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    /// Submits a request and escrows its price from the client.
    pub fn request_storage(&mut self, caller: &Address, request: Request) -> Result<RequestId> {
        // An id that fails to derive also fails `insert`, before any change.
        let scope = request.id().map(Scope::request).unwrap_or_default();
        self.transact("request_storage", scope, |market, events| {
            if request.client != *caller {
                return Err(MarketError::InvalidClient);
            }
            let now = market.clock.now();
            let ask = request.ask.clone();
            let expiry = request.expiry;

            let request_id = market.state.requests.insert(request, now)?;
            let price = ask.price().ok_or(MarketError::Overflow)?;
            market.state.funds.receive(price)?;

            market
                .token
                .transfer_from(caller, &market.custody, price)
                .map_err(MarketError::TransferFailed)?;

            info!(request_id = %request_id, client = %caller, price = %price, "storage requested");
            events.push(MarketEvent::StorageRequested {
                request_id,
                ask,
                expiry,
            });
            Ok(request_id)
        })
    }

    /// Refunds the full price of an expired request that no host ever
    /// filled. Returns the refunded amount.
    pub fn withdraw_funds(&mut self, caller: &Address, request_id: &RequestId) -> Result<Amount> {
        self.transact("withdraw_funds", Scope::request(*request_id), |market, events| {
            let now = market.clock.now();
            let request = market.state.requests.request(request_id)?;
            if now <= request.expiry {
                return Err(MarketError::NotYetExpired);
            }
            if request.client != *caller {
                return Err(MarketError::InvalidClient);
            }
            let refund = request.ask.price().ok_or(MarketError::Overflow)?;

            let context = market.state.requests.context_mut(request_id)?;
            if context.state != RequestState::New || context.slots_filled > 0 {
                return Err(MarketError::NotCancellable);
            }
            context.transition_to(RequestState::Cancelled)?;
            market.state.funds.send(refund)?;

            market
                .token
                .transfer(&market.custody, caller, refund)
                .map_err(MarketError::TransferFailed)?;

            info!(request_id = %request_id, refund = %refund, "request cancelled");
            events.push(MarketEvent::RequestCancelled {
                request_id: *request_id,
            });
            Ok(refund)
        })
    }

    // ---------------------------------------------------------------------
    // Slots
    // ---------------------------------------------------------------------

    /// Fills slot `slot_index` of a request with `caller` as host.
    ///
    /// `proof` is the initial proof of storage for the current period.
    pub fn fill_slot(
        &mut self,
        caller: &Address,
        request_id: &RequestId,
        slot_index: u64,
        proof: &[u8],
    ) -> Result<SlotId> {
        let scope = Scope {
            request: Some(*request_id),
            slot: Some(SlotId::derive(request_id, slot_index)),
            hosts: vec![*caller],
        };
        self.transact("fill_slot", scope, |market, events| {
            let now = market.clock.now();
            let ask = market.state.requests.request(request_id)?.ask.clone();
            if slot_index >= ask.slots {
                return Err(MarketError::InvalidSlotIndex {
                    index: slot_index,
                    slots: ask.slots,
                });
            }
            let slot_id = SlotId::derive(request_id, slot_index);
            let state = market
                .state
                .slots
                .state_within(&slot_id, request_id, &market.state.requests, now)?;
            if state != SlotState::Free {
                return Err(MarketError::SlotNotFree);
            }
            let required = market.config.collateral.initial_amount;
            let available = market.state.collateral.balance_of(caller);
            if available < required {
                return Err(MarketError::InsufficientCollateral {
                    required,
                    available,
                });
            }

            market
                .proofs
                .start_requiring(slot_id, ask.proof_probability, now);
            market.proofs.submit_proof(&slot_id, proof, now)?;

            market
                .state
                .slots
                .fill(slot_id, *request_id, slot_index, *caller);
            let context = market.state.requests.context_mut(request_id)?;
            context.slots_filled += 1;
            events.push(MarketEvent::SlotFilled {
                request_id: *request_id,
                slot_index,
                slot_id,
                host: *caller,
            });
            debug!(request_id = %request_id, slot_index, host = %caller, filled = context.slots_filled, "slot filled");

            if context.slots_filled == ask.slots && context.state == RequestState::New {
                context.transition_to(RequestState::Started)?;
                context.started_at = Some(now);
                info!(request_id = %request_id, started_at = now, "request started");
                events.push(MarketEvent::RequestFulfilled {
                    request_id: *request_id,
                });
            }
            Ok(slot_id)
        })
    }

    /// Submits a periodic proof for a filled slot.
    pub fn submit_proof(&mut self, caller: &Address, slot_id: &SlotId, proof: &[u8]) -> Result<()> {
        let scope = self.slot_scope(slot_id);
        self.transact("submit_proof", scope, |market, _| {
            let now = market.clock.now();
            let slot = market.filled_slot(slot_id, now)?;
            if slot.host != *caller {
                return Err(MarketError::WrongHost);
            }
            market.proofs.submit_proof(slot_id, proof, now)?;
            Ok(())
        })
    }

    /// Releases a slot held by `caller`.
    ///
    /// A finished slot is paid out, a failed slot is only dropped from the
    /// host's active set, and a slot that is still running is forcibly freed.
    pub fn free_slot(&mut self, caller: &Address, slot_id: &SlotId) -> Result<()> {
        let scope = self.slot_scope(slot_id);
        self.transact("free_slot", scope, |market, events| {
            let now = market.clock.now();
            let state = market
                .state
                .slots
                .state(slot_id, &market.state.requests, now)?;
            let slot = match (state, market.state.slots.get(slot_id)) {
                (SlotState::Free, _) | (_, None) => return Err(MarketError::SlotAlreadyFree),
                (_, Some(slot)) => slot.clone(),
            };
            if slot.host != *caller {
                return Err(MarketError::WrongHost);
            }

            match state {
                SlotState::Paid => Err(MarketError::AlreadyPaid),
                SlotState::Finished => market.payout(&slot, slot_id, events),
                SlotState::Failed => {
                    market.state.slots.release(caller, slot_id);
                    market.proofs.stop_requiring(slot_id);
                    debug!(slot_id = %slot_id, host = %caller, "failed slot released");
                    Ok(())
                }
                SlotState::Filled => market.forcibly_free(slot_id, now, events),
                SlotState::Free => Err(MarketError::SlotAlreadyFree),
            }
        })
    }

    /// Records a missed proof and applies the slashing policy.
    ///
    /// Every `slash_criterion`-th miss slashes the host; a host left below
    /// the minimum collateral loses the slot.
    pub fn mark_proof_as_missing(&mut self, slot_id: &SlotId, period: u64) -> Result<()> {
        let scope = self.slot_scope(slot_id);
        self.transact("mark_proof_as_missing", scope, |market, events| {
            let now = market.clock.now();
            let host = market.filled_slot(slot_id, now)?.host;
            market.proofs.mark_missing(slot_id, period, now)?;

            let policy = market.config.collateral;
            let missed = market.proofs.missing_proofs(slot_id);
            debug!(slot_id = %slot_id, period, missed, "proof missed");
            if missed % policy.slash_criterion != 0 {
                return Ok(());
            }

            let amount = market.state.collateral.slash(&host, policy.slash_percentage)?;
            warn!(host = %host, slot_id = %slot_id, amount = %amount, "host slashed");
            events.push(MarketEvent::HostSlashed {
                host,
                slot_id: *slot_id,
                amount,
            });

            if market.state.collateral.balance_of(&host) < policy.minimum_amount {
                market.forcibly_free(slot_id, now, events)?;
            }
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// Runs `op` as one all-or-nothing entry point.
    ///
    /// On success the funds and collateral invariants are asserted and the
    /// buffered events committed. On error the records in `scope` are
    /// restored from the checkpoint taken on entry.
    fn transact<R>(
        &mut self,
        entry: &'static str,
        scope: Scope,
        op: impl FnOnce(&mut Self, &mut Vec<MarketEvent>) -> Result<R>,
    ) -> Result<R> {
        let checkpoint = self.checkpoint(&scope);
        let funds = FundsCheck::begin(&self.state.funds);
        let totals = self.state.collateral.totals();
        let mut pending = Vec::new();

        match op(self, &mut pending) {
            Ok(value) => {
                funds.finish(&self.state.funds);
                self.state
                    .collateral
                    .totals()
                    .assert_progressed_from(&totals);
                for event in pending {
                    info!(entry, event = event.name(), "market event");
                    self.events.push(event);
                }
                Ok(value)
            }
            Err(err) => {
                self.restore(checkpoint);
                warn!(entry, error = %err, "entry point rejected");
                Err(err)
            }
        }
    }

    /// Scope of an entry point acting on an existing slot: the slot, its
    /// request and its host.
    fn slot_scope(&self, slot_id: &SlotId) -> Scope {
        let stored = self.state.slots.get(slot_id);
        Scope {
            request: stored.map(|slot| slot.request_id),
            slot: Some(*slot_id),
            hosts: stored.map(|slot| slot.host).into_iter().collect(),
        }
    }

    fn checkpoint(&self, scope: &Scope) -> Checkpoint<P::Checkpoint> {
        Checkpoint {
            request: scope
                .request
                .map(|request_id| self.state.requests.checkpoint(&request_id)),
            slot: scope.slot.map(|slot_id| {
                (
                    self.state.slots.checkpoint(&slot_id, &scope.hosts),
                    self.proofs.checkpoint(&slot_id),
                )
            }),
            collateral: self.state.collateral.checkpoint(&scope.hosts),
            funds: self.state.funds,
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint<P::Checkpoint>) {
        if let Some(request) = checkpoint.request {
            self.state.requests.restore(request);
        }
        if let Some((slot, proofs)) = checkpoint.slot {
            let slot_id = slot.slot_id();
            self.state.slots.restore(slot);
            self.proofs.restore(&slot_id, proofs);
        }
        self.state.collateral.restore(checkpoint.collateral);
        self.state.funds = checkpoint.funds;
    }

    /// The slot record, provided the slot accepts proofs.
    fn filled_slot(&self, slot_id: &SlotId, now: u64) -> Result<Slot> {
        let state = self
            .state
            .slots
            .state(slot_id, &self.state.requests, now)?;
        match (state, self.state.slots.get(slot_id)) {
            (SlotState::Filled, Some(slot)) => Ok(slot.clone()),
            _ => Err(MarketError::SlotNotAcceptingProofs),
        }
    }

    /// Pays the host of a finished slot its share of the escrow.
    fn payout(&mut self, slot: &Slot, slot_id: &SlotId, events: &mut Vec<MarketEvent>) -> Result<()> {
        let request_id = slot.request_id;
        let amount = self
            .state
            .requests
            .request(&request_id)?
            .ask
            .price_per_slot()
            .ok_or(MarketError::Overflow)?;

        let context = self.state.requests.context_mut(&request_id)?;
        if context.state == RequestState::Started {
            context.transition_to(RequestState::Finished)?;
        }
        self.state.slots.release(&slot.host, slot_id);
        self.state.funds.send(amount)?;
        self.state.slots.mark_paid(slot_id);
        self.proofs.stop_requiring(slot_id);

        self.token
            .transfer(&self.custody, &slot.host, amount)
            .map_err(MarketError::PaymentFailed)?;

        info!(request_id = %request_id, slot_id = %slot_id, host = %slot.host, amount = %amount, "slot paid");
        events.push(MarketEvent::SlotPaid {
            request_id,
            slot_id: *slot_id,
            host: slot.host,
            amount,
        });
        Ok(())
    }

    /// Unlinks the host from a running slot and fails the request when it
    /// has lost more slots than it tolerates.
    fn forcibly_free(&mut self, slot_id: &SlotId, now: u64, events: &mut Vec<MarketEvent>) -> Result<()> {
        let slot = self
            .state
            .slots
            .clear(slot_id)
            .ok_or(MarketError::SlotAlreadyFree)?;
        self.proofs.stop_requiring(slot_id);
        self.lost_slot_collateral(&slot);

        let request_id = slot.request_id;
        let ask = self.state.requests.request(&request_id)?.ask.clone();
        let context = self.state.requests.context_mut(&request_id)?;
        context.slots_filled = context
            .slots_filled
            .checked_sub(1)
            .ok_or(MarketError::Overflow)?;
        info!(request_id = %request_id, slot_id = %slot_id, host = %slot.host, "slot freed");
        events.push(MarketEvent::SlotFreed {
            request_id,
            slot_id: *slot_id,
        });

        let slots_lost = ask.slots - context.slots_filled;
        if slots_lost > ask.max_slot_loss && context.state == RequestState::Started {
            context.transition_to(RequestState::Failed)?;
            context.ends_at = now.saturating_sub(1);
            warn!(request_id = %request_id, slots_lost, max_slot_loss = ask.max_slot_loss, "request failed");
            events.push(MarketEvent::RequestFailed { request_id });
            // TODO: return the client's unspent escrow once failed-request settlement is specified.
        }
        Ok(())
    }

    /// Settlement hook for the collateral backing a slot the host lost.
    ///
    /// Collateral is neither burned nor redistributed yet: it stays with the
    /// host, already reduced by any slashing.
    fn lost_slot_collateral(&self, slot: &Slot) {
        debug!(
            host = %slot.host,
            request_id = %slot.request_id,
            slot_index = slot.slot_index,
            balance = %self.state.collateral.balance_of(&slot.host),
            "lost slot collateral retained"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollateralConfig;
    use crate::proofs::{ProofConfig, ProofError};
    use crate::requests::{Ask, Content};

    const START: u64 = 1_000;

    struct Harness {
        market: SimulatedMarketplace,
        clock: ManualClock,
        client: Address,
        hosts: Vec<Address>,
    }

    fn config() -> MarketConfig {
        MarketConfig {
            collateral: CollateralConfig {
                initial_amount: Amount::new(100),
                minimum_amount: Amount::new(80),
                slash_criterion: 2,
                slash_percentage: 10,
            },
            proofs: ProofConfig {
                period_secs: 10,
                timeout_secs: 5,
            },
        }
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(START);
        let mut market = SimulatedMarketplace::simulated(config(), clock.clone()).expect("market");
        let custody = *market.custody();
        let client = Address::from_label("client");
        let hosts: Vec<Address> = (0..4)
            .map(|i| Address::from_label(&format!("host-{i}")))
            .collect();

        let token = market.token_mut();
        token.mint(&client, Amount::new(100_000));
        token.approve(&client, &custody, Amount::new(100_000));
        for host in &hosts {
            token.mint(host, Amount::new(1_000));
            token.approve(host, &custody, Amount::new(1_000));
        }
        for host in &hosts {
            market
                .deposit_collateral(host, Amount::new(100))
                .expect("deposit");
        }
        market.drain_events();
        Harness {
            market,
            clock,
            client,
            hosts,
        }
    }

    fn request(client: Address, slots: u64, max_slot_loss: u64) -> Request {
        Request {
            client,
            ask: Ask {
                slots,
                slot_size: 1024,
                duration: 100,
                proof_probability: 1,
                reward: Amount::new(3),
                max_slot_loss,
            },
            content: Content {
                cid: "cid".to_string(),
                merkle_root: [1; 32],
            },
            expiry: START + 50,
            nonce: [slots as u8; 32],
        }
    }

    #[test]
    fn request_storage_escrows_price() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 2, 0))
            .expect("request");

        assert_eq!(h.market.funds().received, Amount::new(600));
        assert_eq!(h.market.funds().balance, Amount::new(600));
        assert_eq!(h.market.token().balance_of(&h.client), Amount::new(99_400));
        assert_eq!(h.market.request_state(&id).expect("state"), RequestState::New);
        assert_eq!(h.market.request_end(&id).expect("end"), START + 100);
        assert!(matches!(
            h.market.events(),
            [MarketEvent::StorageRequested { .. }]
        ));
    }

    #[test]
    fn request_storage_rejects_other_caller() {
        let mut h = harness();
        let err = h
            .market
            .request_storage(&h.hosts[0], request(h.client, 1, 0))
            .expect_err("should fail");
        assert_eq!(err, MarketError::InvalidClient);
    }

    #[test]
    fn request_storage_rejects_duplicate() {
        let mut h = harness();
        h.market
            .request_storage(&h.client, request(h.client, 1, 0))
            .expect("request");
        let err = h
            .market
            .request_storage(&h.client, request(h.client, 1, 0))
            .expect_err("should fail");
        assert!(matches!(err, MarketError::DuplicateRequest(_)));
        assert_eq!(h.market.funds().received, Amount::new(300));
    }

    #[test]
    fn failed_escrow_transfer_rolls_back_registration() {
        let mut h = harness();
        h.market.token_mut().set_fail_transfers(true);
        let req = request(h.client, 1, 0);
        let id = req.id().expect("id");

        let err = h.market.request_storage(&h.client, req).expect_err("should fail");

        assert!(matches!(err, MarketError::TransferFailed(_)));
        assert!(matches!(
            h.market.request(&id),
            Err(MarketError::UnknownRequest(_))
        ));
        assert_eq!(h.market.funds(), MarketplaceFunds::default());
        assert!(h.market.events().is_empty());
    }

    #[test]
    fn fill_checks_index_and_collateral() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 2, 0))
            .expect("request");

        assert_eq!(
            h.market.fill_slot(&h.hosts[0], &id, 2, b"proof"),
            Err(MarketError::InvalidSlotIndex { index: 2, slots: 2 })
        );

        let poor = Address::from_label("poor-host");
        assert_eq!(
            h.market.fill_slot(&poor, &id, 0, b"proof"),
            Err(MarketError::InsufficientCollateral {
                required: Amount::new(100),
                available: Amount::ZERO,
            })
        );

        let unknown = RequestId::from_bytes([7; 32]);
        assert!(matches!(
            h.market.fill_slot(&h.hosts[0], &unknown, 0, b"proof"),
            Err(MarketError::UnknownRequest(_))
        ));
    }

    #[test]
    fn fill_rejects_taken_slot_and_bad_proof() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 2, 0))
            .expect("request");

        assert_eq!(
            h.market.fill_slot(&h.hosts[0], &id, 0, b""),
            Err(MarketError::Proof(ProofError::InvalidProof))
        );
        let slot_id = SlotId::derive(&id, 0);
        assert_eq!(h.market.slot_state(&slot_id).expect("state"), SlotState::Free);

        h.market
            .fill_slot(&h.hosts[0], &id, 0, b"proof")
            .expect("fill");
        assert_eq!(
            h.market.fill_slot(&h.hosts[1], &id, 0, b"proof"),
            Err(MarketError::SlotNotFree)
        );
    }

    #[test]
    fn last_fill_starts_request_once() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 2, 1))
            .expect("request");

        h.market.fill_slot(&h.hosts[0], &id, 0, b"proof").expect("fill 0");
        assert_eq!(h.market.request_state(&id).expect("state"), RequestState::New);

        h.clock.advance(7);
        h.market.fill_slot(&h.hosts[1], &id, 1, b"proof").expect("fill 1");
        let context = h.market.request_context(&id).expect("context");
        assert_eq!(context.state, RequestState::Started);
        assert_eq!(context.started_at, Some(START + 7));
        assert_eq!(context.slots_filled, 2);

        // Losing and refilling a slot does not restart the request.
        let slot_id = SlotId::derive(&id, 1);
        h.market.free_slot(&h.hosts[1], &slot_id).expect("free");
        h.clock.advance(20);
        h.market.fill_slot(&h.hosts[2], &id, 1, b"proof").expect("refill");
        let context = h.market.request_context(&id).expect("context");
        assert_eq!(context.started_at, Some(START + 7));
        let fulfilled = h
            .market
            .events()
            .iter()
            .filter(|e| matches!(e, MarketEvent::RequestFulfilled { .. }))
            .count();
        assert_eq!(fulfilled, 1);
    }

    #[test]
    fn collateral_locked_while_backing_slot() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 1, 0))
            .expect("request");
        h.market.fill_slot(&h.hosts[0], &id, 0, b"proof").expect("fill");

        assert_eq!(
            h.market.withdraw_collateral(&h.hosts[0]),
            Err(MarketError::WithdrawalLocked)
        );
        assert_eq!(
            h.market.withdraw_collateral(&h.hosts[1]),
            Ok(Amount::new(100))
        );
    }

    #[test]
    fn free_checks_host_and_state() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 1, 0))
            .expect("request");
        let slot_id = SlotId::derive(&id, 0);

        assert_eq!(
            h.market.free_slot(&h.hosts[0], &slot_id),
            Err(MarketError::SlotAlreadyFree)
        );
        h.market.fill_slot(&h.hosts[0], &id, 0, b"proof").expect("fill");
        assert_eq!(
            h.market.free_slot(&h.hosts[1], &slot_id),
            Err(MarketError::WrongHost)
        );
    }

    #[test]
    fn losing_too_many_slots_fails_request() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 3, 1))
            .expect("request");
        for (i, host) in h.hosts.iter().take(3).enumerate() {
            h.market.fill_slot(host, &id, i as u64, b"proof").expect("fill");
        }
        h.clock.advance(30);

        h.market
            .free_slot(&h.hosts[0], &SlotId::derive(&id, 0))
            .expect("free 0");
        assert_eq!(h.market.request_state(&id).expect("state"), RequestState::Started);

        h.market
            .free_slot(&h.hosts[1], &SlotId::derive(&id, 1))
            .expect("free 1");
        assert_eq!(h.market.request_state(&id).expect("state"), RequestState::Failed);
        let now = h.clock.now();
        assert_eq!(h.market.request_context(&id).expect("context").ends_at, now - 1);
        assert_eq!(h.market.request_end(&id).expect("end"), now - 1);

        // Remaining host's slot reads failed; freeing it pays nothing.
        let remaining = SlotId::derive(&id, 2);
        assert_eq!(h.market.slot_state(&remaining).expect("state"), SlotState::Failed);
        let before = h.market.token().balance_of(&h.hosts[2]);
        h.market.free_slot(&h.hosts[2], &remaining).expect("free failed");
        assert_eq!(h.market.token().balance_of(&h.hosts[2]), before);
        assert!(h.market.active_slots(&h.hosts[2]).is_empty());
    }

    #[test]
    fn rejected_fill_restores_slot_and_proofs() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 1, 0))
            .expect("request");
        let slot_id = SlotId::derive(&id, 0);

        let err = h.market.fill_slot(&h.hosts[0], &id, 0, b"").expect_err("should fail");

        assert_eq!(err, MarketError::Proof(ProofError::InvalidProof));
        assert!(h.market.proofs().tracked(&slot_id).is_none());
        assert!(h.market.slot(&slot_id).is_none());
        assert!(h.market.active_slots(&h.hosts[0]).is_empty());
        assert_eq!(h.market.request_context(&id).expect("context").slots_filled, 0);
        h.market.fill_slot(&h.hosts[0], &id, 0, b"proof").expect("fill");
    }

    #[test]
    fn payout_failure_is_atomic() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 1, 0))
            .expect("request");
        let slot_id = h.market.fill_slot(&h.hosts[0], &id, 0, b"proof").expect("fill");
        h.clock.advance(101);
        let funds = h.market.funds();

        h.market.token_mut().set_fail_transfers(true);
        let err = h.market.free_slot(&h.hosts[0], &slot_id).expect_err("should fail");

        assert!(matches!(err, MarketError::PaymentFailed(_)));
        assert_eq!(h.market.funds(), funds);
        assert_eq!(h.market.slot_state(&slot_id).expect("state"), SlotState::Finished);
        assert_eq!(
            h.market.request_context(&id).expect("context").state,
            RequestState::Started
        );
        assert_eq!(h.market.active_slots(&h.hosts[0]), vec![slot_id]);
        assert!(h.market.proofs().tracked(&slot_id).is_some());

        h.market.token_mut().set_fail_transfers(false);
        h.market.free_slot(&h.hosts[0], &slot_id).expect("retry");
        assert_eq!(h.market.slot_state(&slot_id).expect("state"), SlotState::Paid);
    }

    #[test]
    fn submit_proof_requires_host_and_filled_slot() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 1, 0))
            .expect("request");
        let slot_id = h.market.fill_slot(&h.hosts[0], &id, 0, b"proof").expect("fill");

        // Initial proof already covers this period.
        assert_eq!(
            h.market.submit_proof(&h.hosts[0], &slot_id, b"proof"),
            Err(MarketError::Proof(ProofError::AlreadySubmitted(START / 10)))
        );
        h.clock.advance(10);
        assert!(h.market.is_proof_required(&slot_id));
        assert_eq!(
            h.market.submit_proof(&h.hosts[1], &slot_id, b"proof"),
            Err(MarketError::WrongHost)
        );
        h.market
            .submit_proof(&h.hosts[0], &slot_id, b"proof")
            .expect("submit");

        h.clock.advance(200);
        assert!(!h.market.is_proof_required(&slot_id));
        assert_eq!(
            h.market.submit_proof(&h.hosts[0], &slot_id, b"proof"),
            Err(MarketError::SlotNotAcceptingProofs)
        );
    }

    #[test]
    fn missing_proof_needs_filled_slot() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 1, 0))
            .expect("request");
        let slot_id = SlotId::derive(&id, 0);
        assert_eq!(
            h.market.mark_proof_as_missing(&slot_id, START / 10),
            Err(MarketError::SlotNotAcceptingProofs)
        );
    }

    #[test]
    fn single_miss_below_criterion_does_not_slash() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 1, 0))
            .expect("request");
        let slot_id = h.market.fill_slot(&h.hosts[0], &id, 0, b"proof").expect("fill");

        h.clock.advance(20);
        let period = h.clock.now() / 10 - 1;
        h.market
            .mark_proof_as_missing(&slot_id, period)
            .expect("mark");

        assert_eq!(h.market.missing_proofs(&slot_id), 1);
        assert_eq!(h.market.balance_of(&h.hosts[0]), Amount::new(100));
        assert!(h.market.collateral_totals().slashed.is_zero());
    }

    #[test]
    fn rejected_mark_rolls_back_proof_state() {
        let mut h = harness();
        let id = h
            .market
            .request_storage(&h.client, request(h.client, 1, 0))
            .expect("request");
        let slot_id = h.market.fill_slot(&h.hosts[0], &id, 0, b"proof").expect("fill");

        // Current period has not ended.
        let period = h.clock.now() / 10;
        assert_eq!(
            h.market.mark_proof_as_missing(&slot_id, period),
            Err(MarketError::Proof(ProofError::PeriodNotEnded(period)))
        );
        assert_eq!(h.market.missing_proofs(&slot_id), 0);
    }
}
