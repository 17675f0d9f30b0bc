//! Sync orchestrator
//!
//! A cycle pushes the queue in coalesced batches, applies each delivery
//! outcome, then pulls remote changes newer than the stored cursor. Only one
//! cycle runs at a time. Every network call is raced against cancellation and
//! connectivity loss; an interrupted cycle returns its in-flight entries to
//! `pending`.

use std::future::Future;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::db::{
    with_transaction, ConflictRepository, LocalStore, MetaRepository, NewConflict,
    SqliteConflictRepository, SqliteLocalStore, SqliteMetaRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    ConflictRecord, CycleStatus, Payload, RecordVersion, ResolutionOutcome, SyncSummary,
};
use crate::queue::{DrainedChange, SyncQueue};
use crate::resolver::{resolve, ResolverConfig};
use crate::services::DatabaseService;
use crate::state::{SyncState, SyncStatus};
use crate::tracker::{ChangeTracker, RemoteVersion};
use crate::transport::{
    index_deliveries, BatchRequest, Delivery, DeliveryOutcome, PullRequest, ServerRecord,
    Transport, TransportClient, WireChange,
};
use crate::util::now_ms;

/// Manual choice for an open conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictChoice {
    KeepLocal,
    KeepRemote,
    /// Hand-merged payload
    Payload(Payload),
}

struct Inner<T> {
    service: DatabaseService,
    client: TransportClient<T>,
    config: SyncConfig,
    connectivity: Connectivity,
    cycle_lock: Mutex<()>,
    trigger: Notify,
    cancel: watch::Sender<u64>,
    status: watch::Sender<SyncStatus>,
}

/// Drives sync cycles between the local store and the remote endpoint
pub struct SyncOrchestrator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SyncOrchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport + 'static> SyncOrchestrator<T> {
    pub fn new(
        service: DatabaseService,
        transport: T,
        config: SyncConfig,
        connectivity: Connectivity,
    ) -> Self {
        let (cancel, _) = watch::channel(0);
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            inner: Arc::new(Inner {
                service,
                client: TransportClient::new(transport, config.retry),
                config,
                connectivity,
                cycle_lock: Mutex::new(()),
                trigger: Notify::new(),
                cancel,
                status,
            }),
        }
    }

    pub fn service(&self) -> &DatabaseService {
        &self.inner.service
    }

    /// Status updates, published at the start and end of every cycle
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    /// Ask the background task for a cycle; never blocks
    pub fn request_sync(&self) {
        self.inner.trigger.notify_one();
    }

    /// Interrupt the running cycle, if any
    pub fn cancel(&self) {
        self.inner
            .cancel
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Run one push/pull cycle.
    ///
    /// Returns `Error::SyncInProgress` when another cycle holds the lock.
    /// Offline devices get an `offline` summary without touching the queue.
    pub async fn run_cycle(&self) -> Result<SyncSummary> {
        let Ok(_cycle) = self.inner.cycle_lock.try_lock() else {
            return Err(Error::SyncInProgress);
        };

        let mut summary = SyncSummary::started(now_ms());
        if !self.inner.connectivity.is_online() {
            tracing::info!("Skipping sync cycle: device is offline");
            summary.status = CycleStatus::Offline;
            summary.finished_at = now_ms();
            self.publish(SyncState::Offline, Some(summary.clone()), None);
            return Ok(summary);
        }

        tracing::info!("Starting sync cycle");
        self.publish(SyncState::Syncing, None, None);

        let mut interrupts = Interrupts::new(&self.inner.cancel, &self.inner.connectivity);
        let outcome = self.push_and_pull(&mut summary, &mut interrupts).await;
        summary.finished_at = now_ms();

        match outcome {
            Ok(None) => {
                tracing::info!(
                    "Sync cycle finished: sent {}, acknowledged {}, conflicted {}, failed {}, pulled {}",
                    summary.sent,
                    summary.acknowledged,
                    summary.conflicted,
                    summary.failed,
                    summary.pulled
                );
                self.publish(SyncState::Synced, Some(summary.clone()), None);
                Ok(summary)
            }
            Ok(Some(reason)) => {
                let error = Error::DegradedSync(reason);
                tracing::warn!("{error}");
                summary.status = CycleStatus::Degraded;
                self.publish(SyncState::Error, Some(summary.clone()), Some(error.to_string()));
                Ok(summary)
            }
            Err(Error::Cancelled | Error::Offline) => {
                self.requeue_in_flight().await?;
                summary.status = CycleStatus::Cancelled;
                let state = if self.inner.connectivity.is_online() {
                    SyncState::Idle
                } else {
                    SyncState::Offline
                };
                self.publish(state, Some(summary.clone()), None);
                Ok(summary)
            }
            Err(error) => {
                tracing::error!("Sync cycle failed: {error}");
                if let Err(requeue_error) = self.requeue_in_flight().await {
                    tracing::error!("Failed to requeue in-flight entries: {requeue_error}");
                }
                self.publish(SyncState::Error, None, Some(error.to_string()));
                Err(error)
            }
        }
    }

    /// Settle an open conflict by hand and queue the result for sync
    pub async fn resolve_conflict(&self, id: i64, choice: ConflictChoice) -> Result<ConflictRecord> {
        let conflict = self.inner.service.get_conflict(id).await?;
        if !conflict.is_open() {
            return Err(Error::InvalidInput(format!(
                "conflict {id} was already resolved as {}",
                conflict.outcome
            )));
        }

        let resolved = {
            let _record = self
                .inner
                .service
                .record_locks()
                .lock(&conflict.record_id)
                .await;
            let db = self.inner.service.lock_db().await;
            resolve_manually(db.connection(), &conflict, choice)?
        };

        tracing::info!(
            "Resolved conflict #{} on {} {} as {}",
            resolved.id,
            resolved.kind,
            resolved.record_id,
            resolved.outcome
        );
        self.request_sync();
        Ok(resolved)
    }

    /// Remove a resolved conflict from the audit list
    pub async fn dismiss_conflict(&self, id: i64) -> Result<()> {
        let db = self.inner.service.lock_db().await;
        SqliteConflictRepository::new(db.connection()).dismiss(id)
    }

    /// Give failed entries a fresh retry budget and trigger a cycle
    pub async fn retry_failed(&self) -> Result<usize> {
        let retried = {
            let db = self.inner.service.lock_db().await;
            SyncQueue::new(db.connection()).retry_failed()?
        };
        if retried > 0 {
            tracing::info!("Re-queued {retried} failed entries");
            self.request_sync();
        }
        Ok(retried)
    }

    /// Start the background task: manual triggers, auto-sync on reconnect and
    /// the optional periodic interval.
    pub fn spawn(&self) -> SyncHandle<T> {
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(self.clone().run_background(Arc::clone(&shutdown)));
        SyncHandle {
            orchestrator: self.clone(),
            shutdown,
            task,
        }
    }

    async fn run_background(self, shutdown: Arc<Notify>) {
        let mut online = self.inner.connectivity.subscribe();
        let mut interval = self.inner.config.sync_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        tracing::info!("Background sync started");

        loop {
            let reason = tokio::select! {
                () = shutdown.notified() => break,
                () = self.inner.trigger.notified() => "requested",
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = *online.borrow_and_update();
                    if !is_online || !self.inner.config.auto_sync_on_reconnect {
                        continue;
                    }
                    "reconnected"
                }
                () = next_tick(interval.as_mut()) => "interval",
            };

            tracing::debug!("Sync triggered: {reason}");
            match self.run_cycle().await {
                Ok(_) | Err(Error::SyncInProgress) => {}
                Err(error) => tracing::error!("Background sync cycle failed: {error}"),
            }
        }

        tracing::info!("Background sync stopped");
    }

    /// Push every pending change, then pull. `Ok(Some(reason))` reports a
    /// degraded cycle.
    async fn push_and_pull(
        &self,
        summary: &mut SyncSummary,
        interrupts: &mut Interrupts,
    ) -> Result<Option<String>> {
        let inner = &self.inner;
        let device_id = match &inner.config.device_id {
            Some(device_id) => device_id.clone(),
            None => inner.service.device_id().await?,
        };

        // Entries left in flight by an interrupted run
        self.requeue_in_flight().await?;

        let mut degraded = None;
        loop {
            let (drained, entries) = {
                let db = inner.service.lock_db().await;
                prepare_batch(db.connection(), inner.config.batch_size)?
            };
            if drained.is_empty() {
                break;
            }

            summary.sent += drained.len();
            let request = BatchRequest {
                tenant_id: inner.config.tenant_id.clone(),
                device_id: device_id.clone(),
                entries,
            };
            let mut deliveries = index_deliveries(interrupts.guard(inner.client.deliver(request)).await?);

            for change in &drained {
                let Some(delivery) = deliveries.remove(&change.change.id) else {
                    let db = inner.service.lock_db().await;
                    SyncQueue::new(db.connection()).release(&change.entry_seqs, None, 0)?;
                    continue;
                };
                if let DeliveryOutcome::Exhausted { reason, .. } = &delivery.outcome {
                    degraded = Some(reason.clone());
                }

                let _record = match delivery.outcome {
                    DeliveryOutcome::Conflict { .. } => {
                        Some(inner.service.record_locks().lock(&change.record_id).await)
                    }
                    _ => None,
                };
                let db = inner.service.lock_db().await;
                apply_delivery(db.connection(), change, delivery, &inner.config.resolver, summary)?;
            }

            let db = inner.service.lock_db().await;
            SyncQueue::new(db.connection()).prune_acknowledged()?;
        }

        if let Some(reason) = self.pull(summary, interrupts).await? {
            degraded = Some(reason);
        }
        Ok(degraded)
    }

    /// Pull pages of remote changes until the server has nothing newer
    async fn pull(
        &self,
        summary: &mut SyncSummary,
        interrupts: &mut Interrupts,
    ) -> Result<Option<String>> {
        let inner = &self.inner;
        let mut cursor = {
            let db = inner.service.lock_db().await;
            SqliteMetaRepository::new(db.connection()).pull_cursor()?
        };

        loop {
            let request = PullRequest {
                tenant_id: inner.config.tenant_id.clone(),
                since: cursor,
                limit: inner.config.batch_size,
            };
            let page = match interrupts.guard(inner.client.pull(&request)).await? {
                Ok(page) => page,
                Err(error) => {
                    tracing::warn!("Pulling remote changes failed: {error}");
                    return Ok(Some(format!("pull failed: {error}")));
                }
            };

            let page_len = page.records.len();
            for remote in &page.records {
                let _record = inner.service.record_locks().lock(&remote.id).await;
                let db = inner.service.lock_db().await;
                match apply_pulled(db.connection(), remote, &inner.config.resolver)? {
                    Pulled::Skipped => {}
                    Pulled::Applied => summary.pulled += 1,
                    Pulled::Reconciled => {
                        summary.pulled += 1;
                        summary.conflicted += 1;
                    }
                }
            }

            if page.cursor <= cursor {
                break;
            }
            cursor = page.cursor;
            {
                let db = inner.service.lock_db().await;
                SqliteMetaRepository::new(db.connection()).set_pull_cursor(cursor)?;
            }
            if page_len < inner.config.batch_size {
                break;
            }
        }

        Ok(None)
    }

    async fn requeue_in_flight(&self) -> Result<usize> {
        let db = self.inner.service.lock_db().await;
        SyncQueue::new(db.connection()).requeue_in_flight()
    }

    fn publish(&self, state: SyncState, summary: Option<SyncSummary>, error: Option<String>) {
        self.inner.status.send_modify(|status| {
            status.state = state;
            if summary.is_some() {
                status.last_summary = summary;
            }
            status.last_error = error;
        });
    }
}

/// Handle to the background sync task
pub struct SyncHandle<T> {
    orchestrator: SyncOrchestrator<T>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl<T: Transport + 'static> SyncHandle<T> {
    pub fn request_sync(&self) {
        self.orchestrator.request_sync();
    }

    pub const fn orchestrator(&self) -> &SyncOrchestrator<T> {
        &self.orchestrator
    }

    /// Stop the task, cancelling a cycle that is still running
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        self.orchestrator.cancel();
        if let Err(error) = self.task.await {
            tracing::warn!("Background sync task ended abnormally: {error}");
        }
    }
}

/// Cancellation and connectivity watchers for one cycle
struct Interrupts {
    cancel: watch::Receiver<u64>,
    online: watch::Receiver<bool>,
}

impl Interrupts {
    fn new(cancel: &watch::Sender<u64>, connectivity: &Connectivity) -> Self {
        Self {
            cancel: cancel.subscribe(),
            online: connectivity.subscribe(),
        }
    }

    async fn guard<F: Future>(&mut self, future: F) -> Result<F::Output> {
        let Self { cancel, online } = self;
        let cancelled = async {
            let signalled = cancel.changed().await.is_ok();
            if !signalled {
                std::future::pending::<()>().await;
            }
        };
        let went_offline = async {
            let signalled = online.wait_for(|online| !*online).await.is_ok();
            if !signalled {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            output = future => Ok(output),
            () = cancelled => {
                tracing::info!("Sync cycle cancelled");
                Err(Error::Cancelled)
            }
            () = went_offline => {
                tracing::info!("Connectivity lost during sync cycle");
                Err(Error::Offline)
            }
        }
    }
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Drain the next batch and build its wire entries
fn prepare_batch(
    conn: &Connection,
    batch_size: usize,
) -> Result<(Vec<DrainedChange>, Vec<WireChange>)> {
    with_transaction(conn, |tx| {
        let drained = SyncQueue::new(tx).drain(batch_size)?;
        let store = SqliteLocalStore::new(tx);

        let mut entries = Vec::with_capacity(drained.len());
        for change in &drained {
            let record = store
                .find(&change.record_id)?
                .ok_or_else(|| Error::NotFound(change.record_id.to_string()))?;
            entries.push(WireChange::from_drained(change, &record));
        }
        Ok((drained, entries))
    })
}

fn apply_delivery(
    conn: &Connection,
    change: &DrainedChange,
    delivery: Delivery,
    resolver: &ResolverConfig,
    summary: &mut SyncSummary,
) -> Result<()> {
    let queue = SyncQueue::new(conn);
    match delivery.outcome {
        DeliveryOutcome::Acknowledged { server_revision } => {
            with_transaction(conn, |tx| {
                SyncQueue::new(tx).acknowledge(&change.entry_seqs)?;
                ChangeTracker::new(tx).commit_acknowledged(
                    &change.record_id,
                    server_revision,
                    &change.change.payload,
                )?;
                Ok(())
            })?;
            summary.acknowledged += 1;
        }
        DeliveryOutcome::Conflict { server_record } => {
            reconcile(conn, &server_record, resolver)?;
            summary.conflicted += 1;
        }
        DeliveryOutcome::Rejected { reason } => {
            let error = Error::PermanentRejection {
                record_id: change.record_id.to_string(),
                reason,
            };
            tracing::error!("{error}");
            queue.mark_failed(&change.entry_seqs, &error.to_string(), delivery.attempts)?;
            summary.failed += 1;
        }
        DeliveryOutcome::Exhausted { attempts, reason } => {
            queue.mark_failed(&change.entry_seqs, &reason, attempts)?;
            summary.failed += 1;
        }
    }
    Ok(())
}

enum Pulled {
    Skipped,
    Applied,
    Reconciled,
}

fn apply_pulled(conn: &Connection, remote: &ServerRecord, resolver: &ResolverConfig) -> Result<Pulled> {
    let store = SqliteLocalStore::new(conn);
    if let Some(record) = store.find(&remote.id)? {
        if record
            .server_revision
            .is_some_and(|revision| revision >= remote.revision)
        {
            return Ok(Pulled::Skipped);
        }

        let open = SqliteConflictRepository::new(conn).open_for_record(&record.id)?;
        if open.is_some_and(|conflict| {
            conflict
                .remote
                .revision
                .is_some_and(|revision| revision >= remote.revision)
        }) {
            return Ok(Pulled::Skipped);
        }

        if SyncQueue::new(conn).has_local_changes(&record.id)? {
            reconcile(conn, remote, resolver)?;
            return Ok(Pulled::Reconciled);
        }
    }

    ChangeTracker::new(conn).apply_remote(&remote.id, &remote.to_remote_version())?;
    Ok(Pulled::Applied)
}

/// Resolve a newer server version against the local record and write the
/// result back in one transaction.
fn reconcile(
    conn: &Connection,
    remote: &ServerRecord,
    resolver: &ResolverConfig,
) -> Result<ResolutionOutcome> {
    with_transaction(conn, |tx| {
        let tracker = ChangeTracker::new(tx);
        let queue = SyncQueue::new(tx);
        let conflicts = SqliteConflictRepository::new(tx);
        let remote_version = remote.to_remote_version();

        let Some(record) = SqliteLocalStore::new(tx).find(&remote.id)? else {
            tracker.apply_remote(&remote.id, &remote_version)?;
            return Ok(ResolutionOutcome::RemoteWins);
        };

        let local = RecordVersion {
            payload: record.payload.clone(),
            revision: Some(record.local_revision),
            modified_at: record.modified_at,
            deleted: record.is_deleted,
        };
        let remote_side = RecordVersion {
            payload: remote.payload.clone(),
            revision: Some(remote.revision),
            modified_at: remote.modified_at,
            deleted: remote.deleted,
        };

        let policy = resolver.policy_for(&record.kind);
        let resolution = resolve(policy, record.synced_payload.as_ref(), &local, &remote_side);
        let seqs = queue.unsettled_seqs(&record.id)?;
        let open = conflicts.open_for_record(&record.id)?;

        let Some(payload) = resolution.payload else {
            match open {
                Some(open) => conflicts.update_remote(open.id, &remote_side)?,
                None => {
                    conflicts.insert(&NewConflict {
                        record_id: record.id,
                        kind: record.kind.clone(),
                        local,
                        remote: remote_side,
                        outcome: ResolutionOutcome::Unresolved,
                        resolved_payload: None,
                        conflicting_fields: resolution.conflicting_fields,
                    })?;
                }
            }
            queue.mark_conflicted(
                &seqs,
                &Error::ConflictUnresolved(format!(
                    "{} {} conflicts with server revision {}",
                    record.kind, record.id, remote.revision
                ))
                .to_string(),
            )?;
            return Ok(ResolutionOutcome::Unresolved);
        };

        queue.resolve_entries(&seqs)?;
        if resolution.outcome == ResolutionOutcome::RemoteWins {
            tracker.apply_remote(&record.id, &remote_version)?;
        } else {
            tracker.apply_resolution(&record.id, payload.clone(), resolution.deleted, &remote_version)?;
        }

        if let Some(open) = open {
            conflicts.mark_resolved(open.id, resolution.outcome, Some(&payload))?;
        } else if resolution.superseded {
            conflicts.insert(&NewConflict {
                record_id: record.id,
                kind: record.kind.clone(),
                local,
                remote: remote_side,
                outcome: resolution.outcome,
                resolved_payload: Some(payload),
                conflicting_fields: resolution.conflicting_fields,
            })?;
        }
        queue.prune_acknowledged()?;

        tracing::info!(
            "Resolved {} {} against server revision {}: {}",
            record.kind,
            record.id,
            remote.revision,
            resolution.outcome
        );
        Ok(resolution.outcome)
    })
}

fn resolve_manually(
    conn: &Connection,
    conflict: &ConflictRecord,
    choice: ConflictChoice,
) -> Result<ConflictRecord> {
    with_transaction(conn, |tx| {
        let remote = RemoteVersion {
            kind: conflict.kind.clone(),
            payload: conflict.remote.payload.clone(),
            revision: conflict.remote.revision.ok_or_else(|| {
                Error::InvalidInput(format!("conflict {} has no server revision", conflict.id))
            })?,
            modified_at: conflict.remote.modified_at,
            deleted: conflict.remote.deleted,
        };
        let record = SqliteLocalStore::new(tx)
            .find(&conflict.record_id)?
            .ok_or_else(|| Error::NotFound(conflict.record_id.to_string()))?;

        let queue = SyncQueue::new(tx);
        queue.resolve_entries(&queue.unsettled_seqs(&record.id)?)?;

        let tracker = ChangeTracker::new(tx);
        let (outcome, payload) = match choice {
            ConflictChoice::KeepRemote => {
                tracker.apply_remote(&record.id, &remote)?;
                (ResolutionOutcome::RemoteWins, remote.payload)
            }
            ConflictChoice::KeepLocal => {
                tracker.apply_resolution(
                    &record.id,
                    record.payload.clone(),
                    record.is_deleted,
                    &remote,
                )?;
                (ResolutionOutcome::LocalWins, record.payload)
            }
            ConflictChoice::Payload(payload) => {
                tracker.apply_resolution(&record.id, payload.clone(), false, &remote)?;
                (ResolutionOutcome::Merged, payload)
            }
        };
        queue.prune_acknowledged()?;

        SqliteConflictRepository::new(tx).mark_resolved(conflict.id, outcome, Some(&payload))
    })
}
