//! # Batch Dispatcher
//!
//! Runs the accept calls of one batch concurrently and turns every call into a
//! [`DispatchResult`]. Calls start as soon as they are submitted, so the
//! engine's stagger delay spaces out the requests on the wire; `flush` then
//! waits for the whole batch.
//!
//! ## Classification:
//! - `429` or the limit marker: `Failed(LimitExceeded)`, reservation released.
//! - `401` or the auth marker: `Failed(TokenExpired)`, reservation released.
//! - `200`: `Accepted`, owner confirmed in the ledger.
//! - anything else, or a transport error: counted as an error and resolved
//!   as `Unknown`, which the engine treats like an accepted call. The
//!   reservation is released since the candidate's fate is unknown.
//!
//! A ledger failure while confirming or releasing is a `Failed(Fault)`: the
//! engine stops instead of carrying on with a ledger it cannot trust.
//!
//! Reserved candidates are tracked in the run's [`OpenReservations`]. A call
//! takes its candidate out of that set before touching the ledger, and the
//! engine's teardown only releases what is still in it, so a reservation is
//! released by exactly one side.

use futures_util::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;

use crate::core::error::EngineFault;
use crate::core::feed::{ApiReply, FeedApi, AUTH_MARKER, LIMIT_MARKER};
use crate::core::model::{TaskStats, TerminalReason};
use crate::core::reservation::ReservationStore;

/// Why an accept call ends the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The daily accept quota is spent.
    LimitExceeded,
    /// The credential was rejected.
    TokenExpired,
    /// The ledger failed or the call panicked.
    Fault(String),
}

impl From<FailureReason> for TerminalReason {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::LimitExceeded => TerminalReason::LimitExceeded,
            FailureReason::TokenExpired => TerminalReason::TokenExpired,
            FailureReason::Fault(message) => TerminalReason::Error(message),
        }
    }
}

/// Outcome of one accept call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The feed took the accept.
    Accepted,
    /// Unexpected status or transport error; does not stop the loop.
    Unknown,
    /// Failure-class outcome that ends the run.
    Failed(FailureReason),
}

/// One resolved call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    /// The candidate the call was for.
    pub candidate_id: String,
    /// How it ended.
    pub outcome: AcceptOutcome,
}

/// What an accept reply means, before any ledger side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerClass {
    /// 200 without a failure marker.
    Accepted,
    /// 429 or the limit marker.
    LimitExceeded,
    /// 401 or the auth marker.
    TokenExpired,
    /// Any other status.
    Unexpected,
}

/// Classifies an accept reply. Limit takes precedence over auth.
pub fn classify_answer(reply: &ApiReply) -> AnswerClass {
    if reply.status == 429 || reply.body.contains(LIMIT_MARKER) {
        AnswerClass::LimitExceeded
    } else if reply.status == 401 || reply.body.contains(AUTH_MARKER) {
        AnswerClass::TokenExpired
    } else if reply.status == 200 {
        AnswerClass::Accepted
    } else {
        AnswerClass::Unexpected
    }
}

/// Reservations of one run that no accept call has resolved yet.
///
/// Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct OpenReservations {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl OpenReservations {
    // Every critical section is a single set operation.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a reservation the run now holds.
    pub fn insert(&self, candidate_id: &str) {
        self.lock().insert(candidate_id.to_string());
    }

    /// Claims the right to resolve `candidate_id`. Only the caller that gets
    /// `true` may release the reservation.
    pub fn take(&self, candidate_id: &str) -> bool {
        self.lock().remove(candidate_id)
    }

    /// Claims everything still open.
    pub fn drain(&self) -> Vec<String> {
        self.lock().drain().collect()
    }

    /// Number of unresolved reservations.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether every reservation has been resolved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything an accept call needs, shared by all calls of one engine.
#[derive(Clone)]
struct CallContext {
    api: Arc<dyn FeedApi>,
    store: Arc<dyn ReservationStore>,
    stats: Arc<TaskStats>,
    open: OpenReservations,
    owner: Arc<str>,
    credential: Arc<str>,
}

/// Concurrent accept calls of one engine.
///
/// Dropping the dispatcher aborts every call still in flight.
pub struct BatchDispatcher {
    ctx: CallContext,
    in_flight: JoinSet<DispatchResult>,
}

impl BatchDispatcher {
    /// Creates a dispatcher bound to one owner and credential. Reserved
    /// submissions are tracked in `open`.
    pub fn new(
        api: Arc<dyn FeedApi>,
        store: Arc<dyn ReservationStore>,
        stats: Arc<TaskStats>,
        open: OpenReservations,
        owner: &str,
        credential: &str,
    ) -> Self {
        Self {
            ctx: CallContext {
                api,
                store,
                stats,
                open,
                owner: Arc::from(owner),
                credential: Arc::from(credential),
            },
            in_flight: JoinSet::new(),
        }
    }

    /// Starts the accept call for one candidate. `reserved` says whether the
    /// engine holds a ledger reservation that must be confirmed or released.
    pub fn submit(&mut self, candidate_id: String, reserved: bool) {
        self.ctx.stats.record_request();
        if reserved {
            self.ctx.open.insert(&candidate_id);
        }
        let ctx = self.ctx.clone();
        self.in_flight.spawn(async move {
            let call = accept_one(&ctx, &candidate_id, reserved);
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(outcome) => DispatchResult { candidate_id, outcome },
                Err(_) => DispatchResult {
                    outcome: AcceptOutcome::Failed(FailureReason::Fault(format!(
                        "accept call for {} panicked",
                        candidate_id
                    ))),
                    candidate_id,
                },
            }
        });
    }

    /// Number of calls submitted and not yet collected.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Waits for every submitted call and returns the results in completion
    /// order.
    pub async fn flush(&mut self) -> Vec<DispatchResult> {
        let mut results = Vec::with_capacity(self.in_flight.len());
        while let Some(joined) = self.in_flight.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    let fault = EngineFault::Join(e.to_string());
                    tracing::error!(error = %fault, "accept call did not complete");
                    results.push(DispatchResult {
                        candidate_id: String::new(),
                        outcome: AcceptOutcome::Failed(FailureReason::Fault(fault.to_string())),
                    });
                }
            }
        }
        results
    }

    /// Runs one batch to completion.
    pub async fn dispatch(&mut self, batch: Vec<(String, bool)>) -> Vec<DispatchResult> {
        for (candidate_id, reserved) in batch {
            self.submit(candidate_id, reserved);
        }
        self.flush().await
    }
}

async fn accept_one(ctx: &CallContext, candidate_id: &str, reserved: bool) -> AcceptOutcome {
    let class = match ctx.api.answer(candidate_id, &ctx.credential).await {
        Ok(reply) => classify_answer(&reply),
        Err(e) => {
            tracing::debug!(candidate_id, error = %e, "accept call failed in transport");
            ctx.stats.record_error();
            return release_if_reserved(ctx, candidate_id, reserved, AcceptOutcome::Unknown).await;
        }
    };

    match class {
        AnswerClass::Accepted => {
            // Accepted calls are recorded even when teardown got here first.
            ctx.open.take(candidate_id);
            match ctx.store.confirm(candidate_id, &ctx.owner).await {
                Ok(()) => AcceptOutcome::Accepted,
                Err(e) => {
                    tracing::error!(candidate_id, error = %e, "could not confirm accepted candidate");
                    AcceptOutcome::Failed(FailureReason::Fault(e.to_string()))
                }
            }
        }
        AnswerClass::LimitExceeded => {
            tracing::warn!(candidate_id, "accept limit reached");
            let failed = AcceptOutcome::Failed(FailureReason::LimitExceeded);
            release_if_reserved(ctx, candidate_id, reserved, failed).await
        }
        AnswerClass::TokenExpired => {
            tracing::warn!(candidate_id, "credential rejected by accept call");
            let failed = AcceptOutcome::Failed(FailureReason::TokenExpired);
            release_if_reserved(ctx, candidate_id, reserved, failed).await
        }
        AnswerClass::Unexpected => {
            ctx.stats.record_error();
            release_if_reserved(ctx, candidate_id, reserved, AcceptOutcome::Unknown).await
        }
    }
}

async fn release_if_reserved(
    ctx: &CallContext,
    candidate_id: &str,
    reserved: bool,
    outcome: AcceptOutcome,
) -> AcceptOutcome {
    if !reserved || !ctx.open.take(candidate_id) {
        return outcome;
    }
    match ctx.store.release(candidate_id).await {
        Ok(_) => outcome,
        Err(e) => {
            tracing::error!(candidate_id, error = %e, "could not release reservation");
            AcceptOutcome::Failed(FailureReason::Fault(e.to_string()))
        }
    }
}
