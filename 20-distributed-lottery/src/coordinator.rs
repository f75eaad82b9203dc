//! The draw barrier: no agency learns its winners before every agency has
//! finished submitting bets.
//!
//! Each handler calls [`DrawCoordinator::signal_finish`] when its agency
//! sends `FINISH`. The call that completes the set runs the draw, exactly
//! once, against the full ledger and publishes the result through a `watch`
//! cell. Handlers wait on that cell with [`DrawCoordinator::await_result`].

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::{
    bet::{AgencyId, Bet, Document},
    shutdown::{Outcome, Shutdown},
    store::Ledger,
};

/// Winning documents per agency. Every agency has an entry, possibly empty.
pub type DrawResult = BTreeMap<AgencyId, Vec<Document>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DrawError {
    #[error("draw failed: {0}")]
    DrawFailed(String),
    #[error("draw coordinator went away")]
    Abandoned,
}

#[derive(Debug, Clone)]
enum DrawState {
    Pending,
    Drawn(Arc<DrawResult>),
    Failed(String),
}

/// Groups the documents of winning bets by agency, in storage order.
pub fn select_winners(bets: &[Bet], winning_number: u32, agencies: AgencyId) -> DrawResult {
    let mut result: DrawResult = (1..=agencies).map(|agency| (agency, Vec::new())).collect();
    for bet in bets.iter().filter(|bet| bet.has_won(winning_number)) {
        result.entry(bet.agency).or_default().push(bet.document);
    }
    result
}

pub struct DrawCoordinator {
    agencies: AgencyId,
    winning_number: u32,
    ledger: Arc<Ledger>,
    finished: Mutex<BTreeSet<AgencyId>>,
    state: watch::Sender<DrawState>,
}

impl DrawCoordinator {
    pub fn new(agencies: AgencyId, winning_number: u32, ledger: Arc<Ledger>) -> Self {
        let (state, _) = watch::channel(DrawState::Pending);
        Self {
            agencies,
            winning_number,
            ledger,
            finished: Mutex::new(BTreeSet::new()),
            state,
        }
    }

    /// Records that `agency` has sent all of its bets. Returns `true` for the
    /// call that completed the set and ran the draw.
    pub async fn signal_finish(&self, agency: AgencyId) -> bool {
        let completed = {
            let mut finished = self
                .finished
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if !finished.insert(agency) {
                debug!(agency, "repeated finish ignored");
                return false;
            }
            info!(
                agency,
                finished = finished.len(),
                agencies = self.agencies,
                "agency finished"
            );
            finished.len() == self.agencies as usize
        };

        // The set grows one id at a time, so exactly one call sees it full.
        if completed {
            self.compute_once().await;
        }
        completed
    }

    /// How many distinct agencies have finished so far.
    pub fn finished(&self) -> usize {
        self.finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// The published draw, if it has run and succeeded.
    pub fn result(&self) -> Option<Arc<DrawResult>> {
        match &*self.state.borrow() {
            DrawState::Drawn(result) => Some(Arc::clone(result)),
            _ => None,
        }
    }

    /// Waits for the draw and returns the documents that won for `agency`.
    pub async fn await_result(
        &self,
        agency: AgencyId,
        shutdown: &mut Shutdown,
    ) -> Result<Outcome<Vec<Document>>, DrawError> {
        let mut state = self.state.subscribe();
        let settled = shutdown
            .run(async move {
                let settled = state
                    .wait_for(|state| !matches!(state, DrawState::Pending))
                    .await?;
                Ok::<_, watch::error::RecvError>(DrawState::clone(&settled))
            })
            .await;

        match settled {
            Outcome::Cancelled => Ok(Outcome::Cancelled),
            // Every id the registry admits has an entry, possibly empty.
            Outcome::Completed(Ok(DrawState::Drawn(result))) => Ok(Outcome::Completed(
                result.get(&agency).cloned().unwrap_or_default(),
            )),
            Outcome::Completed(Ok(DrawState::Failed(reason))) => Err(DrawError::DrawFailed(reason)),
            Outcome::Completed(Ok(DrawState::Pending) | Err(_)) => Err(DrawError::Abandoned),
        }
    }

    /// Runs the draw over the whole ledger while holding its lock.
    async fn compute_once(&self) {
        let (winning_number, agencies) = (self.winning_number, self.agencies);
        let drawn = self
            .ledger
            .offload(move |ledger| {
                ledger.read(|bets| (bets.len(), select_winners(bets, winning_number, agencies)))
            })
            .await;

        let state = match drawn {
            Ok((bets, result)) => {
                let winners: usize = result.values().map(Vec::len).sum();
                info!(bets, winners, winning_number = self.winning_number, "draw completed");
                DrawState::Drawn(Arc::new(result))
            }
            Err(err) => {
                error!(error = %err, "draw failed");
                DrawState::Failed(err.to_string())
            }
        };
        self.state.send_replace(state);
    }
}
