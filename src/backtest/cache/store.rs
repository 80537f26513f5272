//! File-backed two-tier cache store.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::watch;

use super::artifact;
use super::locks::{lock, KeyedLocks};
use super::stats::CacheCounters;
use super::{CacheEntry, Tier};
use crate::backtest::{BacktestResult, Fingerprint};
use crate::utils::{ensure_dir, list_files_with_extension, write_file_durable};
use crate::{Error, Result};

const ARTIFACT_EXT: &str = "json";

/// Tunables for a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Upper bound on how long `compute_or_get` waits for someone else's computation.
    pub wait_timeout: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { wait_timeout: Duration::from_secs(300) }
    }
}

/// Budget applied by [`CacheStore::evict_temporary`].
#[derive(Debug, Clone, Default)]
pub struct EvictionPolicy {
    /// Entries not accessed for longer than this are removed.
    pub max_age: Option<chrono::Duration>,
    /// After age eviction, least-recently-accessed entries go until the temporary tier fits.
    pub max_total_bytes: Option<u64>,
}

/// Outcome shared between the computing task and every waiter.
type SharedOutcome = Option<std::result::Result<CacheEntry, String>>;

struct Inner {
    root: PathBuf,
    options: CacheOptions,
    locks: KeyedLocks,
    in_flight: Mutex<HashMap<Fingerprint, watch::Receiver<SharedOutcome>>>,
    size_bytes: AtomicU64,
    counters: Arc<CacheCounters>,
}

/// Two-tier cache of backtest results rooted at one directory.
///
/// Cheap to clone; clones share the lock table and in-flight computations.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    /// Open (or create) a cache rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P, options: CacheOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut size = 0u64;
        for tier in Tier::LOOKUP_ORDER {
            let dir = root.join(tier.dir_name());
            ensure_dir(&dir)?;
            for path in list_files_with_extension(&dir, ARTIFACT_EXT)? {
                size += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            }
        }
        info!("Opened backtest cache at {} ({} bytes)", root.display(), size);

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                options,
                locks: KeyedLocks::default(),
                in_flight: Mutex::new(HashMap::new()),
                size_bytes: AtomicU64::new(size),
                counters: Arc::new(CacheCounters::default()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Running total of artifact bytes across both tiers.
    pub fn size_bytes(&self) -> u64 {
        self.inner.size_bytes.load(Ordering::Relaxed)
    }

    /// Live hit/miss counters, for [`super::StatsAggregator::with_counters`].
    pub fn counters(&self) -> Arc<CacheCounters> {
        self.inner.counters.clone()
    }

    fn entry_path(&self, fingerprint: &Fingerprint, tier: Tier) -> PathBuf {
        self.inner
            .root
            .join(tier.dir_name())
            .join(format!("{}.{}", fingerprint, ARTIFACT_EXT))
    }

    /// Look up `fingerprint`; without a tier, permanent is checked before temporary.
    pub fn get(&self, fingerprint: &Fingerprint, tier: Option<Tier>) -> Result<Option<CacheEntry>> {
        let started = Instant::now();
        let found = match tier {
            | Some(tier) => self.read_entry(fingerprint, tier)?,
            | None => self.read_authoritative(fingerprint)?,
        };
        match &found {
            | Some(_) => self.inner.counters.record_hit(started.elapsed()),
            | None => self.inner.counters.record_miss(),
        }
        Ok(found)
    }

    /// Store `result` under `fingerprint` in `tier`.
    ///
    /// Fails with [`Error::Conflict`] when the tier already holds the
    /// fingerprint and `overwrite` is false. Durable on return.
    pub fn put(
        &self,
        fingerprint: &Fingerprint,
        result: BacktestResult,
        tier: Tier,
        overwrite: bool,
    ) -> Result<CacheEntry> {
        self.inner.locks.with_lock(fingerprint, || {
            if !overwrite && self.entry_path(fingerprint, tier).exists() {
                return Err(Error::Conflict(format!("{fingerprint} already cached in {tier} tier")));
            }
            let now = Utc::now();
            let mut entry = CacheEntry {
                fingerprint: fingerprint.clone(),
                tier,
                result,
                access_count: 0,
                last_accessed_at: now,
                size_bytes: 0,
                created_at: now,
            };
            self.write_entry(&mut entry)?;
            debug!("Cached {} in {} tier ({} bytes)", fingerprint, tier, entry.size_bytes);
            Ok(entry)
        })
    }

    /// Bump the access count of the authoritative entry. Best effort: a
    /// missing entry is a no-op and failures are only logged.
    pub fn record_access(&self, fingerprint: &Fingerprint) {
        if let Err(e) = self.touch(fingerprint) {
            warn!("Could not record access for {}: {}", fingerprint, e);
        }
    }

    fn touch(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        self.inner.locks.with_lock(fingerprint, || {
            let Some(mut entry) = self.read_servable(fingerprint)? else {
                return Ok(None);
            };
            entry.access_count += 1;
            entry.last_accessed_at = Utc::now();
            self.write_entry(&mut entry)?;
            Ok(Some(entry))
        })
    }

    /// Copy the temporary entry into the permanent tier.
    ///
    /// Idempotent: an already-permanent fingerprint is returned unchanged.
    /// The temporary copy is kept.
    pub fn promote(&self, fingerprint: &Fingerprint) -> Result<CacheEntry> {
        self.inner.locks.with_lock(fingerprint, || {
            if let Some(existing) = self.read_entry(fingerprint, Tier::Permanent)? {
                debug!("{} already permanent", fingerprint);
                return Ok(existing);
            }
            let mut entry = self.read_entry(fingerprint, Tier::Temporary)?.ok_or_else(|| {
                Error::NotFound(format!("no temporary or permanent entry for {fingerprint}"))
            })?;
            entry.tier = Tier::Permanent;
            self.write_entry(&mut entry)?;
            info!("Promoted {} to permanent tier", fingerprint);
            Ok(entry)
        })
    }

    /// Administrative delete. The only way a permanent entry goes away.
    pub fn remove(&self, fingerprint: &Fingerprint, tier: Tier) -> Result<bool> {
        self.inner
            .locks
            .with_lock(fingerprint, || self.remove_file(&self.entry_path(fingerprint, tier)))
    }

    /// Administrative wipe of the temporary tier.
    pub fn clear_temporary(&self) -> Result<usize> {
        let dir = self.inner.root.join(Tier::Temporary.dir_name());
        let mut removed = 0;
        for path in list_files_with_extension(&dir, ARTIFACT_EXT)? {
            let Some(fingerprint) = fingerprint_from_path(&path) else {
                continue;
            };
            if self.inner.locks.with_lock(&fingerprint, || self.remove_file(&path))? {
                removed += 1;
            }
        }
        info!("Cleared {} temporary cache entries", removed);
        Ok(removed)
    }

    /// Remove temporary entries over the age or size budget, plus any
    /// unreadable temporary artifact. Never touches the permanent tier.
    pub fn evict_temporary(&self, policy: &EvictionPolicy) -> Result<usize> {
        self.evict_temporary_at(policy, Utc::now())
    }

    pub(crate) fn evict_temporary_at(
        &self,
        policy: &EvictionPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let dir = self.inner.root.join(Tier::Temporary.dir_name());
        let mut candidates = Vec::new();
        let mut evicted = 0;
        for path in list_files_with_extension(&dir, ARTIFACT_EXT)? {
            let Some(fingerprint) = fingerprint_from_path(&path) else {
                continue;
            };
            match self.read_entry(&fingerprint, Tier::Temporary) {
                | Ok(Some(entry)) => candidates.push(entry),
                | Ok(None) => {}
                | Err(Error::Parse(e)) => {
                    warn!("Removing unreadable temporary artifact {}: {}", path.display(), e);
                    if self.remove_if_unreadable(&fingerprint, &path)? {
                        evicted += 1;
                    }
                }
                | Err(e) => warn!("Skipping temporary artifact {}: {}", path.display(), e),
            }
        }

        // least recently accessed first
        candidates.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.fingerprint.cmp(&b.fingerprint))
        });

        let mut total: u64 = candidates.iter().map(|e| e.size_bytes).sum();
        for entry in &candidates {
            let too_old = policy
                .max_age
                .map_or(false, |age| now.signed_duration_since(entry.last_accessed_at) > age);
            let over_budget = policy.max_total_bytes.map_or(false, |budget| total > budget);
            if !too_old && !over_budget {
                continue;
            }
            let path = self.entry_path(&entry.fingerprint, Tier::Temporary);
            if self.inner.locks.with_lock(&entry.fingerprint, || self.remove_file(&path))? {
                total = total.saturating_sub(entry.size_bytes);
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Evicted {} temporary cache entries ({} bytes remain)", evicted, total);
        }
        Ok(evicted)
    }

    /// Delete a temporary artifact that still fails to decode once the key is locked.
    fn remove_if_unreadable(&self, fingerprint: &Fingerprint, path: &Path) -> Result<bool> {
        self.inner.locks.with_lock(fingerprint, || {
            match self.read_entry(fingerprint, Tier::Temporary) {
                | Err(Error::Parse(_)) => self.remove_file(path),
                | _ => Ok(false),
            }
        })
    }

    /// Return the cached entry for `fingerprint`, computing it at most once.
    ///
    /// An unreadable temporary artifact counts as a miss and is replaced.
    /// Concurrent callers for the same fingerprint share one computation and
    /// receive its result or its failure. Waiting is bounded by
    /// [`CacheOptions::wait_timeout`]; dropping or timing out the wait never
    /// cancels the computation, whose result is still cached.
    pub async fn compute_or_get<F, Fut>(&self, fingerprint: &Fingerprint, compute: F) -> Result<CacheEntry>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<BacktestResult>> + Send + 'static,
    {
        let started = Instant::now();
        let fp = fingerprint.clone();
        if let Some(entry) = self.blocking(move |store| store.touch(&fp)).await? {
            self.inner.counters.record_hit(started.elapsed());
            debug!("Cache hit for {}", fingerprint);
            return Ok(entry);
        }
        self.inner.counters.record_miss();

        let mut rx = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.get(fingerprint) {
                | Some(rx) => {
                    debug!("Joining in-flight computation for {}", fingerprint);
                    rx.clone()
                }
                | None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(fingerprint.clone(), rx.clone());
                    self.spawn_computation(fingerprint.clone(), compute, tx);
                    rx
                }
            }
        };

        let timeout = self.inner.options.wait_timeout;
        let wait = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(outcome) = current {
                    return outcome.map_err(Error::Compute);
                }
                if rx.changed().await.is_err() {
                    let last = rx.borrow().clone();
                    return match last {
                        | Some(outcome) => outcome.map_err(Error::Compute),
                        | None => Err(Error::Compute("computation aborted".into())),
                    };
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            | Ok(outcome) => outcome,
            | Err(_) => Err(Error::Timeout(format!(
                "waited {:?} for computation of {}",
                timeout, fingerprint
            ))),
        }
    }

    fn spawn_computation<F, Fut>(&self, fingerprint: Fingerprint, compute: F, tx: watch::Sender<SharedOutcome>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<BacktestResult>> + Send + 'static,
    {
        let store = self.clone();
        tokio::spawn(async move {
            let registration = InFlightRegistration { store: store.clone(), fingerprint: fingerprint.clone() };
            let outcome = store.run_computation(&fingerprint, compute).await;
            if let Err(e) = &outcome {
                error!("Backtest computation for {} failed: {}", fingerprint, e);
            }
            // unregister first: late callers must start fresh, not inherit this outcome
            drop(registration);
            tx.send_replace(Some(outcome.map_err(|e| e.to_string())));
        });
    }

    async fn run_computation<F, Fut>(&self, fingerprint: &Fingerprint, compute: F) -> Result<CacheEntry>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<BacktestResult>> + Send + 'static,
    {
        // another computation may have landed between the caller's miss and registration
        let fp = fingerprint.clone();
        if let Some(entry) = self.blocking(move |store| store.read_servable(&fp)).await? {
            return Ok(entry);
        }

        self.inner.counters.record_computation();
        info!("Computing backtest for {}", fingerprint);
        let started = Instant::now();
        let result = match AssertUnwindSafe(compute()).catch_unwind().await {
            | Ok(Ok(result)) => result,
            | Ok(Err(e)) => return Err(Error::Compute(format!("{e:#}"))),
            | Err(_) => return Err(Error::Compute("backtest computation panicked".into())),
        };
        info!("Computed backtest for {} in {:?}", fingerprint, started.elapsed());

        let fp = fingerprint.clone();
        self.blocking(move |store| match store.put(&fp, result.clone(), Tier::Temporary, false) {
            | Err(Error::Conflict(_)) => match store.read_servable(&fp)? {
                | Some(existing) => Ok(existing),
                // the conflicting file is torn
                | None => store.put(&fp, result, Tier::Temporary, true),
            },
            | other => other,
        })
        .await
    }

    /// Run blocking file I/O off the async executor.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(CacheStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store)).await?
    }

    fn read_authoritative(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        for tier in Tier::LOOKUP_ORDER {
            if let Some(entry) = self.read_entry(fingerprint, tier)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Like [`Self::read_authoritative`], but a torn temporary artifact reads
    /// as absent. A torn permanent artifact is still an error.
    fn read_servable(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.read_entry(fingerprint, Tier::Permanent)? {
            return Ok(Some(entry));
        }
        match self.read_entry(fingerprint, Tier::Temporary) {
            | Err(Error::Parse(e)) => {
                warn!("Ignoring unreadable temporary artifact for {}: {}", fingerprint, e);
                Ok(None)
            }
            | other => other,
        }
    }

    fn read_entry(&self, fingerprint: &Fingerprint, tier: Tier) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(fingerprint, tier);
        let bytes = match fs::read(&path) {
            | Ok(bytes) => bytes,
            | Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            | Err(e) => return Err(e.into()),
        };
        let modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        artifact::decode(&bytes)?
            .into_entry(fingerprint, tier, modified)
            .map(Some)
    }

    fn write_entry(&self, entry: &mut CacheEntry) -> Result<()> {
        let path = self.entry_path(&entry.fingerprint, entry.tier);
        let bytes = artifact::encode(entry)?;
        let previous = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        write_file_durable(&path, &bytes)?;
        entry.size_bytes = bytes.len() as u64;
        self.adjust_size(previous, entry.size_bytes);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<bool> {
        let len = match fs::metadata(path) {
            | Ok(m) => m.len(),
            | Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            | Err(e) => return Err(e.into()),
        };
        match fs::remove_file(path) {
            | Ok(()) => {
                self.adjust_size(len, 0);
                Ok(true)
            }
            | Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            | Err(e) => Err(e.into()),
        }
    }

    fn adjust_size(&self, removed: u64, added: u64) {
        let _ = self
            .inner
            .size_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(removed).saturating_add(added))
            });
    }
}

/// Drops the in-flight slot when the computing task ends, even by panic.
struct InFlightRegistration {
    store: CacheStore,
    fingerprint: Fingerprint,
}

impl Drop for InFlightRegistration {
    fn drop(&mut self) {
        lock(&self.store.inner.in_flight).remove(&self.fingerprint);
    }
}

fn fingerprint_from_path(path: &Path) -> Option<Fingerprint> {
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{fingerprint, ParameterSet};
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn fp(leverage: i64) -> Fingerprint {
        fingerprint(&ParameterSet {
            asset: Some("BTC".into()),
            strategy: Some("momentum".into()),
            leverage: Some(leverage),
            low_threshold: Some(20.0),
            high_threshold: Some(80.0),
            timeframe: Some("4h".into()),
            max_position_ratio: Some(0.25),
            ..Default::default()
        })
        .unwrap()
    }

    fn result(exec_ms: f64) -> BacktestResult {
        BacktestResult {
            execution_time_ms: exec_ms,
            sharpe_ratio: 1.3,
            max_drawdown: -14.0,
            win_rate: 55.0,
            num_trades: 120,
            ..Default::default()
        }
    }

    fn open(dir: &Path) -> CacheStore {
        CacheStore::open(dir, CacheOptions::default()).unwrap()
    }

    #[test]
    fn test_put_then_get() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let entry = store.put(&fp(1), result(100.0), Tier::Temporary, false).unwrap();
        assert_eq!(entry.access_count, 0);
        assert!(entry.size_bytes > 0);
        assert_eq!(store.size_bytes(), entry.size_bytes);

        let got = store.get(&fp(1), None).unwrap().unwrap();
        assert_eq!(got.tier, Tier::Temporary);
        assert_eq!(got.result, result(100.0));
        assert!(store.get(&fp(2), None).unwrap().is_none());
        assert!(store.get(&fp(1), Some(Tier::Permanent)).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_put_conflicts_unless_overwrite() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put(&fp(1), result(100.0), Tier::Temporary, false).unwrap();
        assert_matches!(
            store.put(&fp(1), result(200.0), Tier::Temporary, false),
            Err(Error::Conflict(_))
        );
        let replaced = store.put(&fp(1), result(200.0), Tier::Temporary, true).unwrap();
        assert_eq!(replaced.result.execution_time_ms, 200.0);
        // the same fingerprint may still go to the other tier
        store.put(&fp(1), result(200.0), Tier::Permanent, false).unwrap();
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.put(&fp(3), result(300.0), Tier::Temporary, false).unwrap();
            store.promote(&fp(3)).unwrap();
        }
        let reopened = open(dir.path());
        let entry = reopened.get(&fp(3), None).unwrap().unwrap();
        assert_eq!(entry.tier, Tier::Permanent);
        assert!(reopened.size_bytes() > 0);
    }

    #[test]
    fn test_record_access() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let created = store.put(&fp(1), result(100.0), Tier::Temporary, false).unwrap();
        store.record_access(&fp(1));
        store.record_access(&fp(1));
        let entry = store.get(&fp(1), None).unwrap().unwrap();
        assert_eq!(entry.access_count, 2);
        assert!(entry.last_accessed_at >= created.last_accessed_at);

        // unknown fingerprint is a silent no-op
        store.record_access(&fp(9));
    }

    #[test]
    fn test_promote_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put(&fp(1), result(100.0), Tier::Temporary, false).unwrap();

        let first = store.promote(&fp(1)).unwrap();
        let size_after_first = store.size_bytes();
        let second = store.promote(&fp(1)).unwrap();

        assert_eq!(first.tier, Tier::Permanent);
        assert_eq!(first.result, second.result);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.size_bytes(), size_after_first);
        let permanent = list_files_with_extension(dir.path().join("permanent"), "json").unwrap();
        assert_eq!(permanent.len(), 1);
        // copy, not move
        assert!(store.get(&fp(1), Some(Tier::Temporary)).unwrap().is_some());
    }

    #[test]
    fn test_promote_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        assert_matches!(store.promote(&fp(5)), Err(Error::NotFound(_)));
    }

    #[test]
    fn test_permanent_is_authoritative() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put(&fp(1), result(100.0), Tier::Temporary, false).unwrap();
        store.put(&fp(1), result(999.0), Tier::Permanent, false).unwrap();
        let entry = store.get(&fp(1), None).unwrap().unwrap();
        assert_eq!(entry.tier, Tier::Permanent);
        assert_eq!(entry.result.execution_time_ms, 999.0);
    }

    #[test]
    fn test_corrupt_artifact_surfaces_on_get() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let path = dir.path().join("temporary").join(format!("{}.json", fp(1)));
        fs::write(path, b"{ truncated").unwrap();
        assert_matches!(store.get(&fp(1), None), Err(Error::Parse(_)));
    }

    #[test]
    fn test_eviction_removes_torn_temporary_artifact() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put(&fp(2), result(100.0), Tier::Temporary, false).unwrap();
        let torn = dir.path().join("temporary").join(format!("{}.json", fp(1)));
        fs::write(&torn, b"{ torn").unwrap();

        // no budget is exceeded, the torn file goes anyway
        let policy = EvictionPolicy { max_age: None, max_total_bytes: None };
        assert_eq!(store.evict_temporary(&policy).unwrap(), 1);
        assert!(!torn.exists());
        assert!(store.get(&fp(2), None).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_compute_or_get_replaces_torn_temporary_artifact() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let torn = dir.path().join("temporary").join(format!("{}.json", fp(1)));
        fs::write(&torn, b"{ torn").unwrap();

        let entry = store
            .compute_or_get(&fp(1), || async { Ok::<_, anyhow::Error>(result(77.0)) })
            .await
            .unwrap();
        assert_eq!(entry.tier, Tier::Temporary);
        assert_eq!(entry.result.execution_time_ms, 77.0);
        assert_eq!(store.get(&fp(1), None).unwrap().unwrap().result, result(77.0));
    }

    #[test]
    fn test_evict_by_size_least_recently_accessed_first() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let a = store.put(&fp(1), result(100.0), Tier::Temporary, false).unwrap();
        store.put(&fp(2), result(100.0), Tier::Temporary, false).unwrap();
        store.put(&fp(3), result(100.0), Tier::Temporary, false).unwrap();
        store.put(&fp(4), result(100.0), Tier::Permanent, false).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // fp(1) becomes the most recently used
        store.record_access(&fp(1));

        let budget = a.size_bytes * 2 + a.size_bytes / 2;
        let policy = EvictionPolicy { max_age: None, max_total_bytes: Some(budget) };
        assert_eq!(store.evict_temporary(&policy).unwrap(), 1);

        assert!(store.get(&fp(1), None).unwrap().is_some());
        assert!(store.get(&fp(2), None).unwrap().is_none());
        assert!(store.get(&fp(3), None).unwrap().is_some());
        assert!(store.get(&fp(4), None).unwrap().is_some());
    }

    #[test]
    fn test_evict_by_age_spares_permanent() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put(&fp(1), result(100.0), Tier::Temporary, false).unwrap();
        store.put(&fp(2), result(100.0), Tier::Temporary, false).unwrap();
        store.promote(&fp(2)).unwrap();

        let policy = EvictionPolicy { max_age: Some(chrono::Duration::hours(1)), max_total_bytes: None };
        assert_eq!(store.evict_temporary_at(&policy, Utc::now()).unwrap(), 0);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(store.evict_temporary_at(&policy, later).unwrap(), 2);

        assert!(store.get(&fp(1), None).unwrap().is_none());
        assert_eq!(store.get(&fp(2), None).unwrap().unwrap().tier, Tier::Permanent);
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.put(&fp(1), result(1.0), Tier::Temporary, false).unwrap();
        store.put(&fp(2), result(1.0), Tier::Temporary, false).unwrap();
        store.put(&fp(3), result(1.0), Tier::Permanent, false).unwrap();

        assert!(store.remove(&fp(3), Tier::Permanent).unwrap());
        assert!(!store.remove(&fp(3), Tier::Permanent).unwrap());
        assert_eq!(store.clear_temporary().unwrap(), 2);
        assert_eq!(store.size_bytes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_compute_or_get_runs_once_under_contention() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let (store, calls) = (store.clone(), calls.clone());
            handles.push(tokio::spawn(async move {
                store
                    .compute_or_get(&fp(7), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, anyhow::Error>(result(1234.0))
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap().result);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.counters().computations(), 1);
        assert!(results.iter().all(|r| *r == result(1234.0)));

        // later callers hit the cache without computing
        let again = store
            .compute_or_get(&fp(7), || async {
                Err::<BacktestResult, _>(anyhow::anyhow!("must not run"))
            })
            .await
            .unwrap();
        assert_eq!(again.result, result(1234.0));
        assert!(again.access_count >= 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_compute_failure_reaches_every_waiter() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compute_or_get(&fp(8), || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err::<BacktestResult, _>(anyhow::anyhow!("exchange data unavailable"))
                    })
                    .await
            }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("exchange data unavailable"), "{err}");
        }
        assert!(store.get(&fp(8), None).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiter_times_out_but_computation_completes() {
        let dir = tempdir().unwrap();
        let store = CacheStore::open(
            dir.path(),
            CacheOptions { wait_timeout: Duration::from_millis(20) },
        )
        .unwrap();

        let outcome = store
            .compute_or_get(&fp(9), || async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok::<_, anyhow::Error>(result(42.0))
            })
            .await;
        assert_matches!(outcome, Err(Error::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let entry = store.get(&fp(9), None).unwrap().unwrap();
        assert_eq!(entry.result.execution_time_ms, 42.0);
    }

    async fn exploding_backtest() -> anyhow::Result<BacktestResult> {
        panic!("strategy blew up")
    }

    #[tokio::test]
    async fn test_panicking_computation_is_reported() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let outcome = store
            .compute_or_get(&fp(10), exploding_backtest)
            .await;
        assert_matches!(outcome, Err(Error::Compute(_)));

        // the slot is released, so a retry computes again
        let retry = store
            .compute_or_get(&fp(10), || async { Ok::<_, anyhow::Error>(result(5.0)) })
            .await
            .unwrap();
        assert_eq!(retry.result.execution_time_ms, 5.0);
    }
}
