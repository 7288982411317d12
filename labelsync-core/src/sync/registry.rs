//! Registry of active wallet sessions and their background sync tasks.

use crate::sync::client::SyncClient;
use crate::sync::models::{PullOutcome, SessionStatus};
use crate::sync::session::WalletSyncSession;
use crate::wallet::{Wallet, WalletIdentity};
use crate::{FailureKind, LabelSyncError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Callbacks fired by background sync work. All methods default to no-ops.
pub trait SyncObserver: Send + Sync {
    /// Remote labels were merged into `wallet`.
    fn on_pulled(&self, _wallet: &Arc<dyn Wallet>, _outcome: &PullOutcome) {}

    /// The server's nonce is ahead of the wallet's; a forced pull is needed.
    fn on_wallet_not_synced(&self, _wallet: &Arc<dyn Wallet>) {}

    /// A background upload failed.
    fn on_request_failure(&self, _wallet: &Arc<dyn Wallet>, _error: &LabelSyncError) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// Summary returned by [`SessionRegistry::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub wallets_stopped: usize,
    pub tasks_joined: usize,
}

type SessionMap = HashMap<WalletIdentity, Arc<WalletSyncSession>>;

/// Tracks active sessions and every background task spawned for them.
///
/// Cloning is cheap and yields a handle to the same registry. Each push or
/// pull runs as its own task; [`shutdown`](Self::shutdown) joins them all.
///
/// Every task holds its own handle, so dropping the caller's handles does not
/// cancel in-flight work. Call `shutdown` before the runtime stops, since
/// tasks still running then are cancelled by the runtime.
#[derive(Clone)]
pub struct SessionRegistry {
    client: SyncClient,
    sessions: Arc<RwLock<SessionMap>>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    runtime: Handle,
    observer: Arc<dyn SyncObserver>,
}

impl SessionRegistry {
    /// Create a registry that spawns onto the current Tokio runtime.
    pub fn new(client: SyncClient, observer: Arc<dyn SyncObserver>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| LabelSyncError::Config(format!("no Tokio runtime: {}", e)))?;
        Ok(Self::with_runtime(client, observer, runtime))
    }

    /// Create a registry that spawns onto `runtime`. Its methods may then be
    /// called from threads outside the runtime.
    pub fn with_runtime(
        client: SyncClient,
        observer: Arc<dyn SyncObserver>,
        runtime: Handle,
    ) -> Self {
        Self {
            client,
            sessions: Arc::new(RwLock::new(SessionMap::new())),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            runtime,
            observer,
        }
    }

    fn sessions_read(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions_write(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks_lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `wallet` and kick off a background pull.
    ///
    /// Returns `false` if the wallet is already active or has no fingerprint.
    pub fn start_wallet(&self, wallet: Arc<dyn Wallet>) -> bool {
        let identity = wallet.identity();
        let name = wallet.name().to_string();

        {
            let mut sessions = self.sessions_write();
            if sessions.contains_key(&identity) {
                info!("Wallet {} already active, aborting early.", name);
                return false;
            }

            let session = match WalletSyncSession::open(wallet) {
                Ok(Some(session)) => session,
                Ok(None) => {
                    debug!("Wallet {} has no fingerprint, not syncing", name);
                    return false;
                }
                Err(e) => {
                    warn!("Could not start label sync for {}: {}", name, e);
                    return false;
                }
            };
            sessions.insert(identity, Arc::new(session));
        }

        self.spawn_pull(identity, false);
        info!("{} added.", name);
        true
    }

    /// Remove a wallet's session. Tasks already running for it finish on
    /// their own; no new ones are spawned.
    pub fn stop_wallet(&self, identity: WalletIdentity) -> bool {
        match self.sessions_write().remove(&identity) {
            Some(session) => {
                info!("{} removed from wallets.", session.wallet().name());
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, identity: WalletIdentity) -> bool {
        self.sessions_read().contains_key(&identity)
    }

    pub fn active_wallets(&self) -> Vec<WalletIdentity> {
        self.sessions_read().keys().copied().collect()
    }

    pub fn session(&self, identity: WalletIdentity) -> Option<Arc<WalletSyncSession>> {
        self.sessions_read().get(&identity).cloned()
    }

    /// Look up a session by its server-side wallet id.
    pub fn find_session_by_wallet_id(&self, wallet_id: &str) -> Option<Arc<WalletSyncSession>> {
        self.sessions_read()
            .values()
            .find(|session| session.wallet_id() == wallet_id)
            .cloned()
    }

    /// Whether `session` is still the registered session for its wallet.
    fn is_current(&self, session: &Arc<WalletSyncSession>) -> bool {
        self.sessions_read()
            .get(&session.identity())
            .is_some_and(|active| Arc::ptr_eq(active, session))
    }

    /// Number of tracked tasks that have not been joined yet.
    pub fn pending_tasks(&self) -> usize {
        self.tasks_lock().len()
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks_lock();
        // Reap finished tasks so the set only holds outstanding work.
        while let Some(result) = tasks.try_join_next() {
            log_join_result(result);
        }
        tasks.spawn_on(task, &self.runtime);
    }

    /// Label-changed event: upload the new label in the background.
    ///
    /// No-op for inactive wallets and empty keys. The nonce is advanced
    /// before this returns, without waiting for the upload.
    pub fn set_label(&self, identity: WalletIdentity, key: &str, label: &str) -> bool {
        let Some(session) = self.session(identity) else {
            return false;
        };

        let request = match session.stage_label(key, label) {
            Ok(Some(request)) => request,
            Ok(None) => return false,
            Err(e) => {
                warn!("{}: could not stage label: {}", session.wallet().name(), e);
                return false;
            }
        };

        let registry = self.clone();
        self.spawn(async move {
            if let Err(e) = registry.client.post_label(&request).await {
                registry.report_failure(&request.wallet_id, &e);
            }
        });
        true
    }

    /// Upload every local label of the wallet in the background.
    pub fn push(&self, identity: WalletIdentity) -> bool {
        let Some(session) = self.session(identity) else {
            return false;
        };

        let registry = self.clone();
        self.spawn(async move {
            if !registry.is_current(&session) {
                return;
            }
            if let Err(e) = session.push(&registry.client).await {
                registry.report_failure(session.wallet_id(), &e);
            }
        });
        true
    }

    /// Pull labels in the background.
    ///
    /// A normal pull only logs its failures. A forced pull has nobody to
    /// return its error to, so it goes to the failure hook instead.
    pub fn spawn_pull(&self, identity: WalletIdentity, force: bool) -> bool {
        let Some(session) = self.session(identity) else {
            return false;
        };

        let registry = self.clone();
        self.spawn(async move {
            let wallet_id = session.wallet_id().to_string();
            if let Err(e) = registry.run_pull(session, force).await {
                // Conflicts were already routed by run_pull.
                if e.kind() != FailureKind::NonceConflict {
                    registry.report_failure(&wallet_id, &e);
                }
            }
        });
        true
    }

    /// Pull labels and wait for the result.
    ///
    /// Forced pulls return their failure to the caller; normal pulls log it
    /// and report [`PullOutcome::Deferred`].
    pub async fn pull(&self, identity: WalletIdentity, force: bool) -> Result<PullOutcome> {
        match self.session(identity) {
            Some(session) => self.run_pull(session, force).await,
            None => Ok(PullOutcome::Inactive),
        }
    }

    async fn run_pull(&self, session: Arc<WalletSyncSession>, force: bool) -> Result<PullOutcome> {
        if !self.is_current(&session) {
            return Ok(PullOutcome::Inactive);
        }

        match session.pull(&self.client, force).await {
            Ok(outcome) => {
                if matches!(outcome, PullOutcome::Merged { .. }) {
                    self.observer.on_pulled(session.wallet(), &outcome);
                }
                Ok(outcome)
            }
            Err(e) => {
                warn!("could not retrieve labels: {}", e);
                if e.kind() == FailureKind::NonceConflict {
                    self.report_failure(session.wallet_id(), &e);
                }
                if force {
                    Err(e)
                } else {
                    Ok(PullOutcome::Deferred)
                }
            }
        }
    }

    /// Route a failed request to the observer of the wallet it belongs to.
    fn report_failure(&self, wallet_id: &str, error: &LabelSyncError) {
        let Some(session) = self.find_session_by_wallet_id(wallet_id) else {
            debug!("dropping failure for stopped wallet: {}", error);
            return;
        };

        match error.kind() {
            FailureKind::NonceConflict => {
                info!("{} is not synced with the server", session.wallet().name());
                self.observer.on_wallet_not_synced(session.wallet());
            }
            _ => {
                warn!("label request for {} failed: {}", session.wallet().name(), error);
                self.observer.on_request_failure(session.wallet(), error);
            }
        }
    }

    /// Status of an active wallet.
    pub fn status(&self, identity: WalletIdentity) -> Result<Option<SessionStatus>> {
        self.session(identity)
            .map(|session| session.status())
            .transpose()
    }

    /// Wait for every tracked task, including ones spawned while waiting.
    /// Returns how many tasks were joined.
    pub async fn wait_idle(&self) -> usize {
        let mut joined = 0;
        loop {
            let mut pending = std::mem::take(&mut *self.tasks_lock());
            if pending.is_empty() {
                return joined;
            }
            while let Some(result) = pending.join_next().await {
                log_join_result(result);
                joined += 1;
            }
        }
    }

    /// Stop every wallet and wait for all outstanding tasks to finish.
    ///
    /// Tasks are joined, not aborted. A task still tracked afterwards means
    /// work was spawned after shutdown started, which is reported as
    /// [`LabelSyncError::InvariantViolation`].
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        let mut wallets_stopped = 0;
        for identity in self.active_wallets() {
            if self.stop_wallet(identity) {
                wallets_stopped += 1;
            }
        }

        let tasks_joined = self.wait_idle().await;

        info!(
            "Label sync closed, stopped {} extant wallets, joined {} extant tasks.",
            wallets_stopped, tasks_joined
        );

        let leftover = self.pending_tasks();
        if leftover != 0 {
            error!("{} label sync tasks were left alive on close", leftover);
            return Err(LabelSyncError::InvariantViolation(format!(
                "{} tasks left alive on close",
                leftover
            )));
        }

        Ok(ShutdownReport {
            wallets_stopped,
            tasks_joined,
        })
    }
}

fn log_join_result(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!("label sync task failed: {}", e);
    }
}
