//! Scenario replay against a simulated marketplace.
//!
//! A scenario is a JSON document with a start time and a list of steps.
//! Accounts are referred to by label and requests by the name given when
//! they are created:
//!
//! ```json
//! {
//!   "start": 1000,
//!   "steps": [
//!     { "op": "mint", "account": "client", "amount": 1000 },
//!     { "op": "approve", "account": "client", "amount": 1000 },
//!     { "op": "request", "account": "client", "name": "r1",
//!       "request": { "slots": 1, "duration": 60, "reward": 2, "expiry_in": 30 } },
//!     { "op": "advance", "secs": 61 }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::io::Write;

use cask_market::{
    Ask, Clock, CollateralTotals, Content, ManualClock, MarketConfig, MarketplaceFunds, ProofSystem,
    Request, RequestId, SimulatedMarketplace, SlotId,
};
use cask_token::{Address, Amount};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::CliError;

const fn default_start() -> u64 {
    1_000
}

const fn default_slot_size() -> u64 {
    1024
}

const fn default_probability() -> u64 {
    1
}

fn default_cid() -> String {
    "scenario".to_string()
}

fn default_proof() -> String {
    "proof".to_string()
}

/// A replayable list of steps.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Unix time the clock starts at.
    #[serde(default = "default_start")]
    pub start: u64,
    /// Steps in replay order.
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Parse a scenario from JSON.
    pub fn from_json(content: &str) -> Result<Self, CliError> {
        Ok(serde_json::from_str(content)?)
    }
}

/// Request terms as written in a scenario.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestTerms {
    /// Number of slots.
    pub slots: u64,
    /// Bytes per slot.
    #[serde(default = "default_slot_size")]
    pub slot_size: u64,
    /// Storage duration in seconds.
    pub duration: u64,
    /// Expected periods between proofs.
    #[serde(default = "default_probability")]
    pub proof_probability: u64,
    /// Price per slot per second.
    pub reward: u64,
    /// Slots that may be lost before the request fails.
    #[serde(default)]
    pub max_slot_loss: u64,
    /// Content identifier.
    #[serde(default = "default_cid")]
    pub cid: String,
    /// Seconds from now until the request expires.
    pub expiry_in: u64,
    /// Distinguishes otherwise identical requests.
    #[serde(default)]
    pub nonce: u64,
}

impl RequestTerms {
    fn build(&self, client: Address, now: u64) -> Request {
        let mut nonce = [0u8; 32];
        nonce[24..].copy_from_slice(&self.nonce.to_be_bytes());
        Request {
            client,
            ask: Ask {
                slots: self.slots,
                slot_size: self.slot_size,
                duration: self.duration,
                proof_probability: self.proof_probability,
                reward: Amount::new(self.reward),
                max_slot_loss: self.max_slot_loss,
            },
            content: Content {
                cid: self.cid.clone(),
                merkle_root: [0; 32],
            },
            expiry: now.saturating_add(self.expiry_in),
            nonce,
        }
    }
}

/// One scenario step.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Mint tokens to an account.
    Mint {
        /// Account label.
        account: String,
        /// Tokens minted.
        amount: u64,
    },
    /// Allow the marketplace custody to pull tokens from an account.
    Approve {
        /// Account label.
        account: String,
        /// Allowance.
        amount: u64,
    },
    /// Deposit collateral.
    Deposit {
        /// Host label.
        account: String,
        /// Collateral deposited.
        amount: u64,
    },
    /// Withdraw all collateral.
    Withdraw {
        /// Host label.
        account: String,
    },
    /// Submit a storage request.
    Request {
        /// Client label.
        account: String,
        /// Name later steps use for the request.
        name: String,
        /// Request terms.
        request: RequestTerms,
    },
    /// Withdraw the funds of an expired request.
    WithdrawFunds {
        /// Client label.
        account: String,
        /// Request name.
        request: String,
    },
    /// Fill a slot.
    Fill {
        /// Host label.
        account: String,
        /// Request name.
        request: String,
        /// Slot index.
        slot: u64,
        /// Initial proof.
        #[serde(default = "default_proof")]
        proof: String,
    },
    /// Submit a periodic proof.
    SubmitProof {
        /// Host label.
        account: String,
        /// Request name.
        request: String,
        /// Slot index.
        slot: u64,
        /// Proof bytes.
        #[serde(default = "default_proof")]
        proof: String,
    },
    /// Mark a period's proof as missing; defaults to the previous period.
    MarkMissing {
        /// Request name.
        request: String,
        /// Slot index.
        slot: u64,
        /// Period to mark.
        #[serde(default)]
        period: Option<u64>,
    },
    /// Free a slot.
    Free {
        /// Host label.
        account: String,
        /// Request name.
        request: String,
        /// Slot index.
        slot: u64,
    },
    /// Move the clock forward.
    Advance {
        /// Seconds to advance.
        secs: u64,
    },
}

impl Step {
    /// Operation name as written in scenarios.
    pub const fn op(&self) -> &'static str {
        match self {
            Self::Mint { .. } => "mint",
            Self::Approve { .. } => "approve",
            Self::Deposit { .. } => "deposit",
            Self::Withdraw { .. } => "withdraw",
            Self::Request { .. } => "request",
            Self::WithdrawFunds { .. } => "withdraw_funds",
            Self::Fill { .. } => "fill",
            Self::SubmitProof { .. } => "submit_proof",
            Self::MarkMissing { .. } => "mark_missing",
            Self::Free { .. } => "free",
            Self::Advance { .. } => "advance",
        }
    }
}

/// Final state reported after a replay.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    /// Steps replayed.
    pub steps: usize,
    /// Steps that failed.
    pub failed: usize,
    /// Escrow counters.
    pub funds: MarketplaceFunds,
    /// Collateral totals.
    pub collateral: CollateralTotals,
}

/// A marketplace driven by scenario steps.
#[derive(Debug)]
pub struct Simulation {
    market: SimulatedMarketplace,
    clock: ManualClock,
    requests: HashMap<String, RequestId>,
}

impl Simulation {
    /// Fresh simulation with the clock at `start`.
    pub fn new(config: MarketConfig, start: u64) -> Result<Self, CliError> {
        let clock = ManualClock::new(start);
        let market = SimulatedMarketplace::simulated(config, clock.clone())?;
        Ok(Self {
            market,
            clock,
            requests: HashMap::new(),
        })
    }

    /// The simulated marketplace.
    pub const fn market(&self) -> &SimulatedMarketplace {
        &self.market
    }

    /// Id of a named request.
    pub fn request_id(&self, name: &str) -> Result<RequestId, CliError> {
        self.requests
            .get(name)
            .copied()
            .ok_or_else(|| CliError::UnknownRequest(name.to_string()))
    }

    fn slot_id(&self, request: &str, slot: u64) -> Result<SlotId, CliError> {
        Ok(SlotId::derive(&self.request_id(request)?, slot))
    }

    /// Apply one step.
    pub fn apply(&mut self, step: &Step) -> Result<(), CliError> {
        match step {
            Step::Mint { account, amount } => {
                self.market
                    .token_mut()
                    .mint(&Address::from_label(account), Amount::new(*amount));
            }
            Step::Approve { account, amount } => {
                let custody = *self.market.custody();
                self.market.token_mut().approve(
                    &Address::from_label(account),
                    &custody,
                    Amount::new(*amount),
                );
            }
            Step::Deposit { account, amount } => {
                self.market
                    .deposit_collateral(&Address::from_label(account), Amount::new(*amount))?;
            }
            Step::Withdraw { account } => {
                self.market
                    .withdraw_collateral(&Address::from_label(account))?;
            }
            Step::Request {
                account,
                name,
                request,
            } => {
                if self.requests.contains_key(name) {
                    return Err(CliError::DuplicateName(name.clone()));
                }
                let client = Address::from_label(account);
                let request = request.build(client, self.clock.now());
                let id = self.market.request_storage(&client, request)?;
                self.requests.insert(name.clone(), id);
            }
            Step::WithdrawFunds { account, request } => {
                let id = self.request_id(request)?;
                self.market
                    .withdraw_funds(&Address::from_label(account), &id)?;
            }
            Step::Fill {
                account,
                request,
                slot,
                proof,
            } => {
                let id = self.request_id(request)?;
                self.market
                    .fill_slot(&Address::from_label(account), &id, *slot, proof.as_bytes())?;
            }
            Step::SubmitProof {
                account,
                request,
                slot,
                proof,
            } => {
                let slot_id = self.slot_id(request, *slot)?;
                self.market
                    .submit_proof(&Address::from_label(account), &slot_id, proof.as_bytes())?;
            }
            Step::MarkMissing {
                request,
                slot,
                period,
            } => {
                let slot_id = self.slot_id(request, *slot)?;
                let period = period.unwrap_or_else(|| {
                    self.market
                        .proofs()
                        .period_of(self.clock.now())
                        .saturating_sub(1)
                });
                self.market.mark_proof_as_missing(&slot_id, period)?;
            }
            Step::Free {
                account,
                request,
                slot,
            } => {
                let slot_id = self.slot_id(request, *slot)?;
                self.market
                    .free_slot(&Address::from_label(account), &slot_id)?;
            }
            Step::Advance { secs } => {
                self.clock.advance(*secs);
            }
        }
        Ok(())
    }

    /// Write events committed since the last call as JSON lines.
    pub fn flush_events<W: Write>(&mut self, out: &mut W) -> Result<(), CliError> {
        for event in self.market.drain_events() {
            serde_json::to_writer(&mut *out, &event)?;
            writeln!(out)?;
        }
        Ok(())
    }

    /// Current totals.
    pub fn summary(&self, steps: usize, failed: usize) -> Summary {
        Summary {
            steps,
            failed,
            funds: self.market.funds(),
            collateral: self.market.collateral_totals(),
        }
    }
}

/// Replays `scenario`, writing events and failures to `out`.
///
/// Without `keep_going` the first failing step ends the replay with
/// [`CliError::StepFailed`].
pub fn replay<W: Write>(
    scenario: &Scenario,
    config: MarketConfig,
    keep_going: bool,
    out: &mut W,
) -> Result<Summary, CliError> {
    let mut simulation = Simulation::new(config, scenario.start)?;
    let mut failed = 0;

    for (index, step) in scenario.steps.iter().enumerate() {
        match simulation.apply(step) {
            Ok(()) => simulation.flush_events(out)?,
            Err(err) => {
                error!(step = index, op = step.op(), error = %err, "scenario step failed");
                let report = serde_json::json!({
                    "event": "step_failed",
                    "step": index,
                    "op": step.op(),
                    "error": err.to_string(),
                });
                serde_json::to_writer(&mut *out, &report)?;
                writeln!(out)?;
                if !keep_going {
                    return Err(CliError::StepFailed {
                        index,
                        op: step.op(),
                        source: Box::new(err),
                    });
                }
                failed += 1;
            }
        }
    }

    let summary = simulation.summary(scenario.steps.len(), failed);
    info!(steps = summary.steps, failed, "scenario replayed");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_market::{MarketError, RequestState};

    const LIFECYCLE: &str = r#"{
        "start": 1000,
        "steps": [
            { "op": "mint", "account": "client", "amount": 1000 },
            { "op": "approve", "account": "client", "amount": 1000 },
            { "op": "mint", "account": "host", "amount": 200 },
            { "op": "approve", "account": "host", "amount": 200 },
            { "op": "deposit", "account": "host", "amount": 100 },
            { "op": "request", "account": "client", "name": "r1",
              "request": { "slots": 1, "duration": 60, "reward": 2, "expiry_in": 30 } },
            { "op": "fill", "account": "host", "request": "r1", "slot": 0 },
            { "op": "advance", "secs": 61 },
            { "op": "free", "account": "host", "request": "r1", "slot": 0 }
        ]
    }"#;

    fn lines(out: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(out)
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[test]
    fn replays_full_lifecycle() {
        let scenario = Scenario::from_json(LIFECYCLE).expect("parse");
        let mut out = Vec::new();

        let summary = replay(&scenario, MarketConfig::default(), false, &mut out).expect("replay");

        let events: Vec<String> = lines(&out)
            .iter()
            .map(|v| v["event"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            events,
            [
                "collateral_deposited",
                "storage_requested",
                "slot_filled",
                "request_fulfilled",
                "slot_paid"
            ]
        );
        assert_eq!(summary.steps, 9);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.funds.sent, Amount::new(120));
        assert!(summary.funds.balance.is_zero());
    }

    #[test]
    fn stops_on_first_failure() {
        let scenario = Scenario::from_json(
            r#"{ "steps": [
                { "op": "withdraw_funds", "account": "client", "request": "missing" },
                { "op": "advance", "secs": 1 }
            ] }"#,
        )
        .expect("parse");
        let mut out = Vec::new();

        let err = replay(&scenario, MarketConfig::default(), false, &mut out).expect_err("should fail");

        assert!(matches!(err, CliError::StepFailed { index: 0, op: "withdraw_funds", .. }));
        let reported = lines(&out);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0]["event"], "step_failed");
    }

    #[test]
    fn keep_going_counts_failures() {
        let scenario = Scenario::from_json(
            r#"{ "steps": [
                { "op": "mint", "account": "client", "amount": 500 },
                { "op": "approve", "account": "client", "amount": 500 },
                { "op": "request", "account": "client", "name": "r1",
                  "request": { "slots": 2, "duration": 10, "reward": 1, "expiry_in": 5 } },
                { "op": "fill", "account": "nobody", "request": "r1", "slot": 0 },
                { "op": "withdraw_funds", "account": "client", "request": "r1" },
                { "op": "advance", "secs": 6 },
                { "op": "withdraw_funds", "account": "client", "request": "r1" }
            ] }"#,
        )
        .expect("parse");
        let mut out = Vec::new();

        let summary = replay(&scenario, MarketConfig::default(), true, &mut out).expect("replay");

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.funds.received, Amount::new(20));
        assert_eq!(summary.funds.sent, Amount::new(20));
    }

    #[test]
    fn simulation_tracks_named_requests() {
        let mut sim = Simulation::new(MarketConfig::default(), 100).expect("simulation");
        let steps: Vec<Step> = serde_json::from_str(
            r#"[
                { "op": "mint", "account": "c", "amount": 100 },
                { "op": "approve", "account": "c", "amount": 100 },
                { "op": "request", "account": "c", "name": "a",
                  "request": { "slots": 1, "duration": 5, "reward": 1, "expiry_in": 10 } }
            ]"#,
        )
        .expect("steps");
        for step in &steps {
            sim.apply(step).expect("apply");
        }

        let id = sim.request_id("a").expect("named");
        assert_eq!(sim.market().request_state(&id).expect("state"), RequestState::New);
        assert!(matches!(
            sim.apply(&steps[2]),
            Err(CliError::DuplicateName(name)) if name == "a"
        ));
        assert!(matches!(sim.request_id("b"), Err(CliError::UnknownRequest(_))));
    }

    #[test]
    fn mark_missing_defaults_to_previous_period() {
        let mut sim = Simulation::new(MarketConfig::default(), 1000).expect("simulation");
        let steps: Vec<Step> = serde_json::from_str(
            r#"[
                { "op": "mint", "account": "c", "amount": 1000 },
                { "op": "approve", "account": "c", "amount": 1000 },
                { "op": "mint", "account": "h", "amount": 100 },
                { "op": "approve", "account": "h", "amount": 100 },
                { "op": "deposit", "account": "h", "amount": 100 },
                { "op": "request", "account": "c", "name": "r",
                  "request": { "slots": 1, "duration": 100, "reward": 1, "expiry_in": 10 } },
                { "op": "fill", "account": "h", "request": "r", "slot": 0 },
                { "op": "advance", "secs": 20 },
                { "op": "mark_missing", "request": "r", "slot": 0 }
            ]"#,
        )
        .expect("steps");
        for step in &steps {
            sim.apply(step).expect("apply");
        }

        let slot_id = SlotId::derive(&sim.request_id("r").expect("named"), 0);
        assert_eq!(sim.market().missing_proofs(&slot_id), 1);

        let again = Step::MarkMissing {
            request: "r".into(),
            slot: 0,
            period: None,
        };
        assert!(matches!(
            sim.apply(&again),
            Err(CliError::Market(MarketError::Proof(_)))
        ));
    }
}
