//! Storage requests and their lifecycle.
//!
//! A [`Request`] is immutable once submitted. Everything that changes over
//! its lifetime lives in the [`RequestContext`]. Expiry and completion are
//! never written by a timer: [`RequestRegistry::computed_state`] derives them
//! from the stored state and the current time on every read.

use std::collections::HashMap;
use std::fmt;

use cask_token::{Address, Amount};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MarketError, Result};
use crate::ids::RequestId;

/// Terms a client asks hosts to honour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ask {
    /// Number of slots (replicas) requested.
    pub slots: u64,
    /// Size of each slot in bytes.
    pub slot_size: u64,
    /// Storage duration in seconds, counted from submission.
    pub duration: u64,
    /// One proof is expected, on average, every `proof_probability` periods.
    pub proof_probability: u64,
    /// Price per slot per second.
    pub reward: Amount,
    /// Slots that may be lost before the request fails.
    pub max_slot_loss: u64,
}

impl Ask {
    /// Amount paid to the host of one slot over the full duration.
    #[must_use]
    pub const fn price_per_slot(&self) -> Option<Amount> {
        self.reward.checked_mul(self.duration)
    }

    /// Total amount escrowed for the request.
    #[must_use]
    pub fn price(&self) -> Option<Amount> {
        self.price_per_slot()?.checked_mul(self.slots)
    }
}

/// What is being stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Content identifier of the dataset.
    pub cid: String,
    /// Root of the dataset's merkle tree, used by proofs.
    pub merkle_root: [u8; 32],
}

/// A client's storage request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Client that pays for storage.
    pub client: Address,
    /// Storage terms.
    pub ask: Ask,
    /// Dataset description.
    pub content: Content,
    /// Unix time after which an unstarted request is cancelled.
    pub expiry: u64,
    /// Distinguishes otherwise identical requests.
    pub nonce: [u8; 32],
}

impl Request {
    /// Content-derived identifier.
    pub fn id(&self) -> Result<RequestId> {
        RequestId::derive(self)
    }

    /// Checks the terms are internally consistent at time `now`.
    pub fn validate(&self, now: u64) -> Result<()> {
        let ask = &self.ask;
        if ask.slots == 0 {
            return Err(MarketError::InvalidRequest("slots must be greater than 0".into()));
        }
        if ask.duration == 0 {
            return Err(MarketError::InvalidRequest(
                "duration must be greater than 0".into(),
            ));
        }
        if ask.proof_probability == 0 {
            return Err(MarketError::InvalidRequest(
                "proof_probability must be greater than 0".into(),
            ));
        }
        if ask.max_slot_loss > ask.slots {
            return Err(MarketError::InvalidRequest(format!(
                "max_slot_loss {} exceeds slots {}",
                ask.max_slot_loss, ask.slots
            )));
        }
        if self.expiry <= now {
            return Err(MarketError::InvalidRequest(format!(
                "expiry {} is not in the future",
                self.expiry
            )));
        }
        if ask.price().is_none() {
            return Err(MarketError::InvalidRequest("price overflows".into()));
        }
        Ok(())
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Waiting for hosts to fill its slots.
    New,
    /// All slots were filled; storage is running.
    Started,
    /// Expired before all slots were filled.
    Cancelled,
    /// Ran for its full duration.
    Finished,
    /// Lost more slots than it tolerates.
    Failed,
}

impl RequestState {
    /// Checks if a transition to the target state is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: &Self) -> bool {
        use RequestState::{Cancelled, Failed, Finished, New, Started};

        matches!(
            (self, target),
            (New, Started | Cancelled) | (Started, Finished | Failed)
        )
    }

    /// Returns true for states a request never leaves.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished | Self::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Started => write!(f, "Started"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Finished => write!(f, "Finished"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Mutable lifecycle data of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Stored state; see [`RequestRegistry::computed_state`] for the
    /// observable one.
    pub state: RequestState,
    /// Slots currently filled.
    pub slots_filled: u64,
    /// When the last slot was filled.
    pub started_at: Option<u64>,
    /// When storage ends.
    pub ends_at: u64,
}

impl RequestContext {
    fn new(ends_at: u64) -> Self {
        Self {
            state: RequestState::New,
            slots_filled: 0,
            started_at: None,
            ends_at,
        }
    }

    /// Moves to `target` if the lifecycle allows it.
    pub fn transition_to(&mut self, target: RequestState) -> Result<()> {
        if self.state.can_transition_to(&target) {
            self.state = target;
            Ok(())
        } else {
            Err(MarketError::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    request: Request,
    context: RequestContext,
}

/// A request entry as it stood before an entry point ran.
#[derive(Debug, Clone)]
pub(crate) struct RequestCheckpoint {
    id: RequestId,
    entry: Option<Entry>,
}

/// All requests ever submitted, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct RequestRegistry {
    entries: HashMap<RequestId, Entry>,
}

impl RequestRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a validated request and opens its context.
    ///
    /// `ends_at` is provisionally `now + duration`.
    pub fn insert(&mut self, request: Request, now: u64) -> Result<RequestId> {
        let id = request.id()?;
        if self.entries.contains_key(&id) {
            return Err(MarketError::DuplicateRequest(id.to_hex()));
        }
        request.validate(now)?;
        let ends_at = now
            .checked_add(request.ask.duration)
            .ok_or(MarketError::Overflow)?;

        debug!(request_id = %id, ends_at, "request registered");
        self.entries.insert(
            id,
            Entry {
                request,
                context: RequestContext::new(ends_at),
            },
        );
        Ok(id)
    }

    /// Whether `id` is known.
    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of stored requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request was ever stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The immutable request.
    pub fn request(&self, id: &RequestId) -> Result<&Request> {
        self.entry(id).map(|e| &e.request)
    }

    /// The stored context.
    pub fn context(&self, id: &RequestId) -> Result<&RequestContext> {
        self.entry(id).map(|e| &e.context)
    }

    /// Mutable context.
    pub fn context_mut(&mut self, id: &RequestId) -> Result<&mut RequestContext> {
        self.entries
            .get_mut(id)
            .map(|e| &mut e.context)
            .ok_or_else(|| MarketError::UnknownRequest(id.to_hex()))
    }

    /// Captures the entry for `id`, present or not.
    pub(crate) fn checkpoint(&self, id: &RequestId) -> RequestCheckpoint {
        RequestCheckpoint {
            id: *id,
            entry: self.entries.get(id).cloned(),
        }
    }

    /// Puts a captured entry back.
    pub(crate) fn restore(&mut self, checkpoint: RequestCheckpoint) {
        match checkpoint.entry {
            Some(entry) => self.entries.insert(checkpoint.id, entry),
            None => self.entries.remove(&checkpoint.id),
        };
    }

    /// Observable state at time `now`.
    pub fn computed_state(&self, id: &RequestId, now: u64) -> Result<RequestState> {
        let entry = self.entry(id)?;
        let state = match entry.context.state {
            RequestState::New if now > entry.request.expiry => RequestState::Cancelled,
            RequestState::Started if now > entry.context.ends_at => RequestState::Finished,
            state => state,
        };
        Ok(state)
    }

    /// End of storage as seen at `now`.
    ///
    /// Once the request is over the reported end is never later than
    /// `now - 1`.
    pub fn end(&self, id: &RequestId, now: u64) -> Result<u64> {
        let ends_at = self.context(id)?.ends_at;
        match self.computed_state(id, now)? {
            RequestState::New | RequestState::Started => Ok(ends_at),
            _ => Ok(ends_at.min(now.saturating_sub(1))),
        }
    }

    fn entry(&self, id: &RequestId) -> Result<&Entry> {
        self.entries
            .get(id)
            .ok_or_else(|| MarketError::UnknownRequest(id.to_hex()))
    }
}
