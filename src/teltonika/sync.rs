//! TeltonikaSyncer: periodic SSH polling of one router into Postgres
//!
//! Every tick: reuse or open the SSH session, read gsmctl values, insert
//! them stamped with the cycle start time. Failures are logged and the
//! cycle is skipped; the next tick retries. Cycles never overlap.

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::db::SampleStore;
use crate::error::{MonitorError, Result};
use crate::models::{CycleOutcome, PollCycle, SyncSummary};
use crate::teltonika::RouterSource;

/// Ingestion loop for a single router
pub struct TeltonikaSyncer<R: RouterSource, S: SampleStore> {
    router: R,
    store: S,
    interval: Duration,
    session: Option<R::Session>,
    seq: u64,
}

impl<R: RouterSource, S: SampleStore> TeltonikaSyncer<R, S> {
    pub fn new(router: R, store: S, interval: Duration) -> Self {
        Self {
            router,
            store,
            interval,
            session: None,
            seq: 0,
        }
    }

    /// Create the storage tables. Called once before `run`.
    pub async fn prepare(&self, hypertables: bool) -> Result<()> {
        tracing::info!(
            "[TeltonikaSync] Ensuring tables exist (hypertables: {})",
            hypertables
        );
        self.store.ensure_tables(hypertables).await
    }

    /// Run the loop until `shutdown` resolves, then close the session
    pub async fn run<F>(mut self, shutdown: F) -> SyncSummary
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            "[TeltonikaSync] Starting sync of {} (interval: {}s)",
            self.router.host(),
            self.interval.as_secs()
        );

        let mut timer = time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut summary = SyncSummary::default();

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = timer.tick() => {}
            }

            let cycle = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("[TeltonikaSync] Shutdown requested during a cycle");
                    break;
                }
                cycle = self.poll_once() => cycle,
            };

            tracing::debug!(
                "[TeltonikaSync] Cycle record: {}",
                serde_json::to_string(&cycle).unwrap_or_default()
            );

            summary.cycles += 1;
            if !cycle.is_success() {
                summary.failed += 1;
            }
        }

        if let Some(session) = self.session.take() {
            self.router.disconnect(session).await;
        }

        tracing::info!(
            "[TeltonikaSync] Stopped after {} cycles ({} failed)",
            summary.cycles,
            summary.failed
        );
        summary
    }

    /// One connect-read-write cycle
    pub async fn poll_once(&mut self) -> PollCycle {
        self.seq += 1;
        let started_at = Utc::now();

        let outcome = match self.collect(started_at).await {
            Ok((samples, attributes)) => {
                tracing::info!(
                    "[TeltonikaSync] Cycle {}: stored {} samples, {} attributes",
                    self.seq,
                    samples,
                    attributes
                );
                CycleOutcome::Success {
                    samples,
                    attributes,
                }
            }
            Err(e) => {
                tracing::error!(
                    "[TeltonikaSync] Cycle {} failed ({}): {}",
                    self.seq,
                    e.kind(),
                    e
                );
                CycleOutcome::Failed {
                    kind: e.kind(),
                    error: e.to_string(),
                }
            }
        };

        PollCycle {
            seq: self.seq,
            started_at,
            outcome,
        }
    }

    async fn collect(&mut self, time: DateTime<Utc>) -> Result<(usize, usize)> {
        let reading = self.read().await?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let dump = serde_json::to_string(&reading).unwrap_or_default();
            tracing::debug!("[TeltonikaSync] Cycle {} raw values: {}", self.seq, dump);
        }

        if reading.is_empty() {
            return Err(MonitorError::Read("router reported no values".into()));
        }

        let (samples, attributes) = reading.into_rows(self.router.host(), time);

        // Attempt both tables even if the first write fails
        let samples_written = self.store.write_samples(&samples).await;
        let attributes_written = self.store.write_attributes(&attributes).await;

        Ok((samples_written?, attributes_written?))
    }

    async fn read(&mut self) -> Result<crate::models::RouterReading> {
        let session = match self.session.take() {
            Some(session) if self.router.is_alive(&session) => session,
            Some(dead) => {
                tracing::debug!("[TeltonikaSync] Replacing dead session");
                self.router.disconnect(dead).await;
                self.router.connect().await?
            }
            None => self.router.connect().await?,
        };

        let session = self.session.insert(session);
        let result = self.router.read_values(session).await;

        if !self.router.is_alive(session) {
            if let Some(dead) = self.session.take() {
                self.router.disconnect(dead).await;
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use crate::models::{DeviceAttribute, RouterReading, TelemetrySample};

    // ------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct RouterLog {
        connects: usize,
        disconnects: usize,
        reads: Vec<Instant>,
    }

    #[derive(Clone)]
    struct FakeRouter {
        log: Arc<Mutex<RouterLog>>,
        values: BTreeMap<String, f64>,
        read_delay: Duration,
        // 1-based connect attempts that fail
        failing_connects: Vec<usize>,
        // 1-based reads that break the session
        broken_reads: Vec<usize>,
    }

    impl FakeRouter {
        fn new(values: &[(&str, f64)]) -> Self {
            Self {
                log: Arc::default(),
                values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                read_delay: Duration::ZERO,
                failing_connects: Vec::new(),
                broken_reads: Vec::new(),
            }
        }
    }

    struct FakeSession {
        alive: bool,
    }

    #[async_trait]
    impl RouterSource for FakeRouter {
        type Session = FakeSession;

        async fn connect(&self) -> Result<FakeSession> {
            let attempt = {
                let mut log = self.log.lock().unwrap();
                log.connects += 1;
                log.connects
            };
            if self.failing_connects.contains(&attempt) {
                return Err(MonitorError::Unreachable("no route to host".into()));
            }
            Ok(FakeSession { alive: true })
        }

        async fn read_values(&self, session: &mut FakeSession) -> Result<RouterReading> {
            let read_no = {
                let mut log = self.log.lock().unwrap();
                log.reads.push(Instant::now());
                log.reads.len()
            };
            time::sleep(self.read_delay).await;
            if self.broken_reads.contains(&read_no) {
                session.alive = false;
                return Err(MonitorError::Unreachable("connection reset".into()));
            }
            Ok(RouterReading {
                metrics: self.values.clone(),
                attributes: BTreeMap::new(),
            })
        }

        fn is_alive(&self, session: &FakeSession) -> bool {
            session.alive
        }

        async fn disconnect(&self, _session: FakeSession) {
            self.log.lock().unwrap().disconnects += 1;
        }

        fn host(&self) -> &str {
            "192.168.1.1"
        }
    }

    #[derive(Default)]
    struct StoreLog {
        ensure_calls: Vec<bool>,
        batches: Vec<Vec<TelemetrySample>>,
        attributes: Vec<DeviceAttribute>,
    }

    #[derive(Clone, Default)]
    struct FakeStore {
        log: Arc<Mutex<StoreLog>>,
        // 1-based write_samples calls that fail
        failing_writes: Vec<usize>,
    }

    #[async_trait]
    impl SampleStore for FakeStore {
        async fn ensure_tables(&self, hypertables: bool) -> Result<()> {
            self.log.lock().unwrap().ensure_calls.push(hypertables);
            Ok(())
        }

        async fn write_samples(&self, samples: &[TelemetrySample]) -> Result<usize> {
            let mut log = self.log.lock().unwrap();
            let call = log.batches.len() + 1;
            if self.failing_writes.contains(&call) {
                log.batches.push(Vec::new());
                return Err(MonitorError::Storage("connection refused".into()));
            }
            log.batches.push(samples.to_vec());
            Ok(samples.len())
        }

        async fn write_attributes(&self, attributes: &[DeviceAttribute]) -> Result<usize> {
            self.log.lock().unwrap().attributes.extend_from_slice(attributes);
            Ok(attributes.len())
        }
    }

    /// Log output captured through the same filter the binary installs
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Run a failing cycle and a successful one under the verbosity flags
    async fn cycle_logs(flags: &[&str]) -> String {
        use clap::Parser;

        let mut argv = vec!["teltonika-monitor", "-H", "192.168.1.1", "-P", "secret"];
        argv.extend_from_slice(flags);
        let cli = crate::config::Cli::try_parse_from(argv).unwrap();
        let directives = cli
            .log_directives()
            .unwrap_or(crate::config::DEFAULT_LOG_DIRECTIVES);

        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(directives))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut router = FakeRouter::new(&[("signal", -71.0)]);
        router.failing_connects = vec![1];
        let mut syncer = TeltonikaSyncer::new(router, FakeStore::default(), Duration::from_secs(60));
        syncer.poll_once().await;
        syncer.poll_once().await;

        let bytes = logs.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    fn gaps(starts: &[Instant]) -> Vec<Duration> {
        starts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_cycles_spaced_by_interval() {
        let router = FakeRouter::new(&[("signal", -71.0)]);
        let store = FakeStore::default();
        let syncer = TeltonikaSyncer::new(router.clone(), store.clone(), Duration::from_secs(10));

        let summary = syncer.run(time::sleep(Duration::from_secs(35))).await;

        assert_eq!(summary, SyncSummary { cycles: 4, failed: 0 });
        let reads = router.log.lock().unwrap().reads.clone();
        assert_eq!(gaps(&reads), vec![Duration::from_secs(10); 3]);
        assert_eq!(router.log.lock().unwrap().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycles_do_not_overlap() {
        let mut router = FakeRouter::new(&[("signal", -71.0)]);
        router.read_delay = Duration::from_secs(8);
        let store = FakeStore::default();
        let syncer = TeltonikaSyncer::new(router.clone(), store.clone(), Duration::from_secs(5));

        syncer.run(time::sleep(Duration::from_secs(40))).await;

        let reads = router.log.lock().unwrap().reads.clone();
        assert!(reads.len() >= 3);
        for gap in gaps(&reads) {
            assert!(gap >= Duration::from_secs(8), "cycles overlapped: {:?}", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_skips_only_that_cycle() {
        let mut router = FakeRouter::new(&[("signal", -71.0)]);
        router.failing_connects = vec![1];
        let store = FakeStore::default();
        let syncer = TeltonikaSyncer::new(router.clone(), store.clone(), Duration::from_secs(10));

        let start = Instant::now();
        let summary = syncer.run(time::sleep(Duration::from_secs(15))).await;

        assert_eq!(summary, SyncSummary { cycles: 2, failed: 1 });
        // cycle 1 wrote nothing, cycle 2 ran on schedule and wrote
        let log = store.log.lock().unwrap();
        assert_eq!(log.batches.len(), 1);
        let reads = router.log.lock().unwrap().reads.clone();
        assert_eq!(reads, vec![start + Duration::from_secs(10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rows_share_cycle_timestamp() {
        let router = FakeRouter::new(&[("battery_voltage", 52.3), ("load_watts", 1200.0)]);
        let store = FakeStore::default();
        let mut syncer = TeltonikaSyncer::new(router, store.clone(), Duration::from_secs(60));

        let cycle = syncer.poll_once().await;

        assert_eq!(
            cycle.outcome,
            CycleOutcome::Success {
                samples: 2,
                attributes: 0
            }
        );
        let log = store.log.lock().unwrap();
        let batch = &log.batches[0];
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|s| s.time == cycle.started_at));
        assert_eq!(batch[0].metric, "battery_voltage");
        assert_eq!(batch[0].value, 52.3);
        assert_eq!(batch[1].metric, "load_watts");
        assert_eq!(batch[1].value, 1200.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_session_reconnects_next_cycle() {
        let mut router = FakeRouter::new(&[("signal", -71.0)]);
        router.broken_reads = vec![1];
        let store = FakeStore::default();
        let mut syncer = TeltonikaSyncer::new(router.clone(), store.clone(), Duration::from_secs(60));

        let first = syncer.poll_once().await;
        let second = syncer.poll_once().await;

        assert!(!first.is_success());
        assert!(second.is_success());
        let log = router.log.lock().unwrap();
        assert_eq!(log.connects, 2);
        assert_eq!(log.disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_is_not_fatal() {
        let router = FakeRouter::new(&[("signal", -71.0)]);
        let store = FakeStore {
            failing_writes: vec![1],
            ..FakeStore::default()
        };
        let syncer = TeltonikaSyncer::new(router.clone(), store.clone(), Duration::from_secs(10));

        let summary = syncer.run(time::sleep(Duration::from_secs(25))).await;

        assert_eq!(summary, SyncSummary { cycles: 3, failed: 1 });
        // the session survives a storage error
        assert_eq!(router.log.lock().unwrap().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_reading_is_read_error() {
        let router = FakeRouter::new(&[]);
        let store = FakeStore::default();
        let mut syncer = TeltonikaSyncer::new(router, store.clone(), Duration::from_secs(60));

        let cycle = syncer.poll_once().await;

        assert!(matches!(cycle.outcome, CycleOutcome::Failed { kind: "read", .. }));
        assert!(store.log.lock().unwrap().batches.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_session() {
        let router = FakeRouter::new(&[("signal", -71.0)]);
        let store = FakeStore::default();
        let syncer = TeltonikaSyncer::new(router.clone(), store, Duration::from_secs(10));

        syncer.run(time::sleep(Duration::from_secs(1))).await;

        let log = router.log.lock().unwrap();
        assert_eq!(log.connects, 1);
        assert_eq!(log.disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_slow_cycle() {
        let mut router = FakeRouter::new(&[("signal", -71.0)]);
        router.read_delay = Duration::from_secs(30);
        let store = FakeStore::default();
        let syncer = TeltonikaSyncer::new(router.clone(), store.clone(), Duration::from_secs(10));

        let summary = syncer.run(time::sleep(Duration::from_secs(5))).await;

        assert_eq!(summary.cycles, 0);
        assert!(store.log.lock().unwrap().batches.is_empty());
        assert_eq!(router.log.lock().unwrap().disconnects, 1);
    }

    #[tokio::test]
    async fn test_quiet_keeps_only_errors() {
        let logs = cycle_logs(&["--quiet"]).await;

        assert!(logs.contains("Cycle 1 failed"), "{}", logs);
        assert!(!logs.contains("Cycle 2: stored"), "{}", logs);
        assert!(!logs.contains("raw values"), "{}", logs);
    }

    #[tokio::test]
    async fn test_debug_dumps_raw_values() {
        let logs = cycle_logs(&["--debug"]).await;

        assert!(logs.contains("Cycle 1 failed"), "{}", logs);
        assert!(logs.contains("Cycle 2 raw values:"), "{}", logs);
        assert!(logs.contains("\"signal\":-71.0"), "{}", logs);
        assert!(logs.contains("Cycle 2: stored 1 samples"), "{}", logs);
    }

    #[tokio::test]
    async fn test_default_verbosity_logs_cycles_without_dumps() {
        let logs = cycle_logs(&[]).await;

        assert!(logs.contains("Cycle 1 failed"), "{}", logs);
        assert!(logs.contains("Cycle 2: stored 1 samples"), "{}", logs);
        assert!(!logs.contains("raw values"), "{}", logs);
    }

    #[tokio::test]
    async fn test_prepare_passes_hypertable_flag_once() {
        let store = FakeStore::default();
        let syncer = TeltonikaSyncer::new(
            FakeRouter::new(&[]),
            store.clone(),
            Duration::from_secs(60),
        );

        tokio_test::assert_ok!(syncer.prepare(true).await);
        assert_eq!(store.log.lock().unwrap().ensure_calls, vec![true]);

        // a second startup against the same database is harmless
        tokio_test::assert_ok!(syncer.prepare(true).await);
        assert_eq!(store.log.lock().unwrap().ensure_calls, vec![true, true]);
    }
}
