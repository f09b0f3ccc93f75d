use super::LeaseStore;
use crate::config::{LEASE_JITTER_FACTOR, LeaseTimings};
use crate::core::{LockRecord, RestoreError, Result, VersionedLock};
use chrono::Utc;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{Level, event, info_span};

/// Lease duration written on step-down; the empty holder is what frees the lock.
const RELEASED_LEASE_MS: u64 = 1_000;
const RELEASE_MAX_ATTEMPTS: usize = 5;

/// Identifies one lock and the contender competing for it.
#[derive(Debug, Clone)]
pub struct MutexConfig {
    pub namespace: String,
    pub lock_key: String,
    pub identity: String,
    pub timings: LeaseTimings,
}

impl MutexConfig {
    pub fn new(
        namespace: impl Into<String>,
        lock_key: impl Into<String>,
        identity: impl Into<String>,
        timings: LeaseTimings,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            lock_key: lock_key.into(),
            identity: identity.into(),
            timings,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.lock_key.trim().is_empty() {
            return Err(RestoreError::Config("lock key must not be empty".to_string()));
        }
        if self.identity.trim().is_empty() {
            return Err(RestoreError::Config(
                "lock holder identity must not be empty".to_string(),
            ));
        }
        self.timings.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseStatus {
    Held,
    Lost,
    Released,
}

/// Last lock record this contender saw, and when it first saw it.
///
/// Expiry of another holder's lease is judged against this local monotonic
/// observation time, never against the record's wall-clock timestamps.
struct Observation {
    lock: Option<VersionedLock>,
    observed_at: Instant,
}

impl Observation {
    fn new() -> Self {
        Self {
            lock: None,
            observed_at: Instant::now(),
        }
    }

    fn observe(&mut self, lock: VersionedLock) {
        let changed = self
            .lock
            .as_ref()
            .is_none_or(|known| known.record != lock.record);
        if changed {
            self.observed_at = Instant::now();
        }
        self.lock = Some(lock);
    }
}

/// A cluster-wide mutex over a lease record.
///
/// At most one contender holds the lease for a given `(namespace, lock_key)`.
/// Losing contenders retry every `retry_period` (with jitter) until the holder
/// steps down or its lease expires.
#[derive(Clone)]
pub struct DistributedMutex {
    store: Arc<dyn LeaseStore>,
    config: MutexConfig,
}

impl DistributedMutex {
    pub fn new(store: Arc<dyn LeaseStore>, config: MutexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &MutexConfig {
        &self.config
    }

    /// Blocks until this contender holds the lease.
    ///
    /// There is no timeout at this layer. Store failures other than write
    /// conflicts abort with [`RestoreError::Lock`].
    pub async fn acquire(&self) -> Result<LeaseGuard> {
        let span = info_span!(
            "lease.acquire",
            lock = %self.config.lock_key,
            identity = %self.config.identity
        );
        let mut observation = Observation::new();
        {
            let _enter = span.enter();
            event!(Level::INFO, "attempting to acquire lease");
        }

        loop {
            match try_acquire_or_renew(self.store.as_ref(), &self.config, &mut observation).await
            {
                Ok(true) => break,
                Ok(false) => {
                    let holder = observation
                        .lock
                        .as_ref()
                        .map(|lock| lock.record.holder_identity.clone())
                        .unwrap_or_default();
                    let _enter = span.enter();
                    event!(Level::DEBUG, holder = %holder, "lease is held by another contender");
                }
                Err(err) if err.is_conflict() => {
                    let _enter = span.enter();
                    event!(Level::DEBUG, error = %err, "lost lease acquisition race");
                }
                Err(err) => {
                    let _enter = span.enter();
                    event!(Level::ERROR, error = %err, "lease backend failure");
                    return Err(RestoreError::Lock(format!(
                        "failed to acquire lease {}/{}: {}",
                        self.config.namespace, self.config.lock_key, err
                    )));
                }
            }
            sleep(jittered(self.config.timings.retry_period)).await;
        }

        {
            let _enter = span.enter();
            event!(Level::INFO, "successfully acquired lease");
        }
        Ok(LeaseGuard::start(
            self.store.clone(),
            self.config.clone(),
            observation,
        ))
    }

    /// Callback form: runs `on_acquired` while holding the lease, then steps down.
    ///
    /// `on_lost` is invoked once if the lease was lost before `on_acquired`
    /// finished. The work itself is not interrupted.
    pub async fn run_exclusive<F, Fut, T, L>(&self, on_acquired: F, on_lost: L) -> Result<T>
    where
        F: FnOnce(LeaseWatch) -> Fut,
        Fut: Future<Output = T>,
        L: FnOnce(),
    {
        let guard = self.acquire().await?;
        let output = on_acquired(guard.watch()).await;
        if !guard.is_held() {
            on_lost();
        }
        guard.release().await?;
        Ok(output)
    }
}

/// Read-only view of whether a lease is still held.
#[derive(Clone)]
pub struct LeaseWatch {
    status: watch::Receiver<LeaseStatus>,
}

impl LeaseWatch {
    pub fn is_held(&self) -> bool {
        *self.status.borrow() == LeaseStatus::Held
    }

    /// Resolves when renewal fails and the lease can no longer be trusted.
    ///
    /// Never resolves after a voluntary release.
    pub async fn lost(&self) {
        let mut status = self.status.clone();
        if status.wait_for(|s| *s == LeaseStatus::Lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Proof of holding the lease. Keeps it renewed until [`LeaseGuard::release`].
///
/// Dropping the guard stops renewal without stepping down; the lease then
/// expires after its duration.
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    config: MutexConfig,
    status: watch::Receiver<LeaseStatus>,
    status_tx: Arc<watch::Sender<LeaseStatus>>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<Observation>>,
}

impl LeaseGuard {
    fn start(store: Arc<dyn LeaseStore>, config: MutexConfig, observation: Observation) -> Self {
        let (status_tx, status) = watch::channel(LeaseStatus::Held);
        let status_tx = Arc::new(status_tx);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let join_handle = tokio::spawn(renew_loop(
            store.clone(),
            config.clone(),
            observation,
            status_tx.clone(),
            stop_rx,
        ));
        Self {
            store,
            config,
            status,
            status_tx,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn lock_key(&self) -> &str {
        &self.config.lock_key
    }

    pub fn is_held(&self) -> bool {
        *self.status.borrow() == LeaseStatus::Held
    }

    pub fn watch(&self) -> LeaseWatch {
        LeaseWatch {
            status: self.status.clone(),
        }
    }

    pub async fn lost(&self) {
        self.watch().lost().await
    }

    /// Steps down: stops renewal and frees the record for the next contender.
    ///
    /// A no-op on the record if another contender already took it over.
    pub async fn release(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let mut observation = match self.join_handle.take() {
            Some(handle) => handle
                .await
                .map_err(|err| RestoreError::Lock(format!("lease renewal join: {}", err)))?,
            None => Observation::new(),
        };
        let was_held = self.is_held();
        self.status_tx.send_replace(LeaseStatus::Released);

        step_down(self.store.as_ref(), &self.config, &mut observation).await?;
        event!(
            Level::INFO,
            lock = %self.config.lock_key,
            identity = %self.config.identity,
            was_held,
            "stepped down from lease"
        );
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

async fn renew_loop(
    store: Arc<dyn LeaseStore>,
    config: MutexConfig,
    mut observation: Observation,
    status_tx: Arc<watch::Sender<LeaseStatus>>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Observation {
    let timings = config.timings;
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = sleep(timings.retry_period) => {}
        }

        let renewal = timeout(
            timings.renew_deadline,
            renew_until_deadline(store.as_ref(), &config, &mut observation),
        );
        let renewed = tokio::select! {
            _ = &mut stop_rx => break,
            renewed = renewal => renewed.unwrap_or(false),
        };

        if !renewed {
            event!(
                Level::ERROR,
                lock = %config.lock_key,
                identity = %config.identity,
                "failed to renew lease within deadline, lease lost"
            );
            status_tx.send_replace(LeaseStatus::Lost);
            break;
        }
    }
    observation
}

/// Retries renewal every `retry_period` until it succeeds or the lease is taken.
async fn renew_until_deadline(
    store: &dyn LeaseStore,
    config: &MutexConfig,
    observation: &mut Observation,
) -> bool {
    loop {
        match try_acquire_or_renew(store, config, observation).await {
            Ok(true) => return true,
            Ok(false) => return false,
            Err(err) => {
                event!(
                    Level::WARN,
                    lock = %config.lock_key,
                    error = %err,
                    "lease renewal attempt failed"
                );
                sleep(config.timings.retry_period).await;
            }
        }
    }
}

/// One acquisition or renewal attempt.
///
/// Returns `Ok(false)` while another contender holds an unexpired lease.
async fn try_acquire_or_renew(
    store: &dyn LeaseStore,
    config: &MutexConfig,
    observation: &mut Observation,
) -> Result<bool> {
    let now = Utc::now();
    let mut desired = LockRecord {
        holder_identity: config.identity.clone(),
        lease_duration_ms: duration_ms(config.timings.lease_duration),
        acquire_time: now,
        renew_time: now,
        leader_transitions: 0,
    };

    let Some(current) = store.get_lock(&config.namespace, &config.lock_key).await? else {
        let created = store
            .create_lock(&config.namespace, &config.lock_key, desired)
            .await?;
        observation.observe(created);
        return Ok(true);
    };
    observation.observe(current.clone());

    let record = &current.record;
    let held_by_us = record.holder_identity == config.identity;
    if !held_by_us && !record.is_released() {
        let lease = Duration::from_millis(record.lease_duration_ms);
        if observation.observed_at + lease > Instant::now() {
            return Ok(false);
        }
    }

    if held_by_us {
        desired.acquire_time = record.acquire_time;
        desired.leader_transitions = record.leader_transitions;
    } else {
        desired.leader_transitions = record.leader_transitions.saturating_add(1);
    }

    let updated = store
        .update_lock(
            &config.namespace,
            &config.lock_key,
            &VersionedLock {
                resource_version: current.resource_version,
                record: desired,
            },
        )
        .await?;
    observation.observe(updated);
    Ok(true)
}

async fn step_down(
    store: &dyn LeaseStore,
    config: &MutexConfig,
    observation: &mut Observation,
) -> Result<()> {
    for _ in 0..RELEASE_MAX_ATTEMPTS {
        let current = match store.get_lock(&config.namespace, &config.lock_key).await {
            Ok(Some(current)) => current,
            Ok(None) => return Ok(()),
            Err(err) => {
                return Err(RestoreError::Lock(format!(
                    "failed to read lease {}/{} for release: {}",
                    config.namespace, config.lock_key, err
                )));
            }
        };
        if current.record.holder_identity != config.identity {
            return Ok(());
        }

        let now = Utc::now();
        let released = VersionedLock {
            resource_version: current.resource_version,
            record: LockRecord {
                holder_identity: String::new(),
                lease_duration_ms: RELEASED_LEASE_MS,
                acquire_time: now,
                renew_time: now,
                leader_transitions: current.record.leader_transitions,
            },
        };
        match store
            .update_lock(&config.namespace, &config.lock_key, &released)
            .await
        {
            Ok(updated) => {
                observation.observe(updated);
                return Ok(());
            }
            Err(err) if err.is_conflict() => continue,
            Err(err) => {
                return Err(RestoreError::Lock(format!(
                    "failed to release lease {}/{}: {}",
                    config.namespace, config.lock_key, err
                )));
            }
        }
    }
    Err(RestoreError::Lock(format!(
        "failed to release lease {}/{} after {} conflicting attempts",
        config.namespace, config.lock_key, RELEASE_MAX_ATTEMPTS
    )))
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn jittered(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.0..LEASE_JITTER_FACTOR);
    period + period.mul_f64(factor)
}
