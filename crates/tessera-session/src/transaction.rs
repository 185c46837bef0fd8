//! Transaction boundaries and completion callbacks.
//!
//! A [`TransactionCoordinator`] moves through
//! `NotStarted -> Active -> {Committed | RolledBack}`, with
//! `MarkedForRollback` reachable only from `Active`. Before-commit callbacks
//! run in registration order right before the physical commit and never
//! after a rollback decision. After-completion callbacks run in registration
//! order exactly once per transaction, whatever its outcome, including a
//! failed commit and a transaction abandoned because its future was dropped.
//!
//! The externally managed variant never issues BEGIN, COMMIT or ROLLBACK;
//! an ambient transaction manager drives it through
//! [`TransactionCoordinator::before_completion`] and
//! [`TransactionCoordinator::after_completion`].

use asupersync::{Cx, Outcome};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tessera_core::{Connection, Error, Result, TransactionErrorKind};

/// Lifecycle of one logical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    NotStarted,
    Active,
    MarkedForRollback,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransactionStatus::Active | TransactionStatus::MarkedForRollback
        )
    }
}

type BeforeCommit = Box<dyn FnOnce() -> Result<()> + Send>;
type AfterCompletion = Box<dyn FnOnce(TransactionStatus) + Send>;

struct TransactionState {
    status: TransactionStatus,
    before_commit: Vec<BeforeCommit>,
    after_completion: Vec<AfterCompletion>,
    rollback_pending: bool,
    count: u64,
}

/// Tracks the transaction of one session.
///
/// Clones share state, so a drop guard can complete the transaction of the
/// session it was taken from.
#[derive(Clone)]
pub struct TransactionCoordinator {
    state: Arc<Mutex<TransactionState>>,
    externally_managed: bool,
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TransactionCoordinator")
            .field("status", &state.status)
            .field("before_commit", &state.before_commit.len())
            .field("after_completion", &state.after_completion.len())
            .field("externally_managed", &self.externally_managed)
            .finish()
    }
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn not_active() -> Error {
    Error::transaction(TransactionErrorKind::NotActive, "no transaction is active")
}

impl TransactionCoordinator {
    /// Coordinator that issues BEGIN, COMMIT and ROLLBACK itself.
    pub fn new() -> Self {
        Self::with_management(false)
    }

    /// Coordinator for a transaction owned by an ambient manager.
    pub fn external() -> Self {
        Self::with_management(true)
    }

    fn with_management(externally_managed: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransactionState {
                status: TransactionStatus::NotStarted,
                before_commit: Vec::new(),
                after_completion: Vec::new(),
                rollback_pending: false,
                count: 0,
            })),
            externally_managed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> TransactionStatus {
        self.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    pub fn is_externally_managed(&self) -> bool {
        self.externally_managed
    }

    /// Transactions begun so far.
    pub fn transaction_count(&self) -> u64 {
        self.lock().count
    }

    /// Register a callback to run right before the physical commit.
    #[allow(clippy::result_large_err)]
    pub fn register_before_commit(
        &self,
        callback: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let mut state = self.lock();
        if !state.status.is_active() {
            return Err(not_active());
        }
        state.before_commit.push(Box::new(callback));
        Ok(())
    }

    /// Register a callback to run once the transaction completes.
    #[allow(clippy::result_large_err)]
    pub fn register_after_completion(
        &self,
        callback: impl FnOnce(TransactionStatus) + Send + 'static,
    ) -> Result<()> {
        let mut state = self.lock();
        if !state.status.is_active() {
            return Err(not_active());
        }
        state.after_completion.push(Box::new(callback));
        Ok(())
    }

    /// Forbid the active transaction from committing.
    #[allow(clippy::result_large_err)]
    pub fn mark_rollback_only(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.status.is_active() {
            return Err(not_active());
        }
        state.status = TransactionStatus::MarkedForRollback;
        Ok(())
    }

    pub fn is_marked_for_rollback(&self) -> bool {
        self.status() == TransactionStatus::MarkedForRollback
    }

    /// Take the flag left by an abandoned transaction whose ROLLBACK has
    /// not been sent yet.
    pub fn take_rollback_pending(&self) -> bool {
        std::mem::take(&mut self.lock().rollback_pending)
    }

    pub fn is_rollback_pending(&self) -> bool {
        self.lock().rollback_pending
    }

    #[tracing::instrument(level = "debug", skip(self, cx, conn))]
    pub async fn begin<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<(), Error> {
        if self.is_active() {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already active on this session",
            ));
        }
        if !self.externally_managed {
            match conn.begin(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        let mut state = self.lock();
        state.status = TransactionStatus::Active;
        state.count += 1;
        tracing::debug!(transaction = state.count, "Transaction begun");
        Outcome::Ok(())
    }

    /// Commit, unless the transaction was marked for rollback or a
    /// before-commit callback fails, in which case it is rolled back and an
    /// error is returned.
    #[tracing::instrument(level = "debug", skip(self, cx, conn))]
    pub async fn commit<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<(), Error> {
        match self.status() {
            TransactionStatus::Active => {}
            TransactionStatus::MarkedForRollback => {
                let _ = self.rollback(cx, conn).await;
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::MarkedForRollback,
                    "transaction was marked for rollback",
                ));
            }
            _ => return Outcome::Err(not_active()),
        }

        if let Err(e) = self.run_before_commit() {
            let _ = self.rollback(cx, conn).await;
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::BeforeCompletion,
                format!("before-commit callback failed: {e}"),
            ));
        }

        if self.externally_managed {
            self.complete(TransactionStatus::Committed);
            return Outcome::Ok(());
        }
        let outcome = conn.commit(cx).await;
        match &outcome {
            Outcome::Ok(()) => {
                tracing::debug!("Transaction committed");
                self.complete(TransactionStatus::Committed);
            }
            _ => {
                tracing::warn!("Commit failed; transaction treated as rolled back");
                self.complete(TransactionStatus::RolledBack);
            }
        }
        outcome
    }

    /// Roll back the active transaction. Before-commit callbacks are
    /// discarded; after-completion callbacks run even if the ROLLBACK fails.
    #[tracing::instrument(level = "debug", skip(self, cx, conn))]
    pub async fn rollback<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<(), Error> {
        if !self.is_active() {
            return Outcome::Err(not_active());
        }
        self.lock().before_commit.clear();
        if self.externally_managed {
            self.complete(TransactionStatus::RolledBack);
            return Outcome::Ok(());
        }
        let outcome = conn.rollback(cx).await;
        if !matches!(outcome, Outcome::Ok(())) {
            tracing::warn!("ROLLBACK did not complete; it will be reissued");
            self.lock().rollback_pending = true;
        }
        self.complete(TransactionStatus::RolledBack);
        outcome
    }

    /// Run the before-commit callbacks for an ambient transaction manager.
    #[allow(clippy::result_large_err)]
    pub fn before_completion(&self) -> Result<()> {
        match self.status() {
            TransactionStatus::Active => self.run_before_commit(),
            TransactionStatus::MarkedForRollback => Err(Error::transaction(
                TransactionErrorKind::MarkedForRollback,
                "transaction was marked for rollback",
            )),
            _ => Err(not_active()),
        }
    }

    /// Report the outcome decided by an ambient transaction manager.
    pub fn after_completion(&self, status: TransactionStatus) {
        if status == TransactionStatus::RolledBack {
            self.lock().before_commit.clear();
        }
        self.complete(status);
    }

    /// Complete a transaction whose future was dropped before it finished.
    ///
    /// No statement can be sent from here, so a self-managed transaction
    /// leaves a pending rollback for the session to issue later.
    pub fn abandon(&self) {
        {
            let mut state = self.lock();
            if !state.status.is_active() {
                return;
            }
            state.before_commit.clear();
            state.rollback_pending = !self.externally_managed;
        }
        tracing::warn!("Transaction abandoned before completion; rolling back");
        self.complete(TransactionStatus::RolledBack);
    }

    #[allow(clippy::result_large_err)]
    fn run_before_commit(&self) -> Result<()> {
        let callbacks = std::mem::take(&mut self.lock().before_commit);
        for callback in callbacks {
            callback()?;
        }
        Ok(())
    }

    fn complete(&self, status: TransactionStatus) {
        let callbacks = {
            let mut state = self.lock();
            state.status = status;
            state.before_commit.clear();
            std::mem::take(&mut state.after_completion)
        };
        for callback in callbacks {
            callback(status);
        }
    }

    /// Guard that abandons the transaction unless disarmed.
    pub fn guard(&self) -> CompletionGuard {
        CompletionGuard {
            coordinator: self.clone(),
            armed: true,
        }
    }
}

/// Completes a transaction as rolled back when dropped while armed.
#[derive(Debug)]
pub struct CompletionGuard {
    coordinator: TransactionCoordinator,
    armed: bool,
}

impl CompletionGuard {
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.abandon();
        }
    }
}
