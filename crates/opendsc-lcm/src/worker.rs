//! The scheduled enforcement loop
//!
//! A single-threaded cooperative state machine: each cycle resolves the
//! configuration (local path or pulled bundle), runs `test` (and `set` in
//! Remediate mode), reports, then sleeps through an interruptible delay.
//! Settings snapshots are read at the top of each cycle and on every delay
//! poll tick; a changed interval restarts the wait, a changed mode
//! re-enters the loop. Exactly two suspension points exist per cycle: the
//! awaited child process and the delay.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use opendsc_core::types::{ConfigurationMode, ConfigurationSource, OperationKind};
use opendsc_core::wire::ComplianceReportRequest;
use opendsc_core::{Error, Result};

use crate::executor::{Enforcer, Execution};
use crate::pull::BundleSource;
use crate::settings::{LcmSettings, SettingsStore};

/// Stable event ids for once-per-cycle failure and recovery logs
const EVENT_CYCLE_FAILED: &str = "lcm.cycle.failed";
const EVENT_CYCLE_RECOVERED: &str = "lcm.cycle.recovered";

/// Cap on the error back-off sleep
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Default delay poll tick
const DEFAULT_POLL: Duration = Duration::from_secs(1);

/// Why an interruptible delay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    /// The full duration elapsed
    Elapsed,
    /// The configured interval changed; restart the wait with the new value
    IntervalChanged(Duration),
    /// The configuration mode changed; re-enter the loop
    ModeChanged,
    /// Cancellation was signaled
    Cancelled,
}

/// What one cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Test (and possibly set) ran; whether the node ended in desired state
    Completed { in_desired_state: bool },
    /// The configuration file does not exist
    SkippedMissingFile,
    /// The pull refresh soft-failed; retry next interval
    SkippedPullFailure,
    /// The resolved path changed during the test; set was skipped
    SkippedPathChanged,
}

/// Sleep `total`, waking early on cancellation, interval change, or mode
/// change
///
/// The sleep is divided into poll ticks; worst-case reaction time is one
/// tick.
pub async fn interruptible_delay(
    store: &SettingsStore,
    cancel: &CancellationToken,
    baseline: &LcmSettings,
    total: Duration,
    poll: Duration,
) -> DelayOutcome {
    let mut remaining = total;
    loop {
        if remaining.is_zero() {
            return DelayOutcome::Elapsed;
        }
        let tick = remaining.min(poll);

        tokio::select! {
            _ = cancel.cancelled() => return DelayOutcome::Cancelled,
            _ = tokio::time::sleep(tick) => {}
        }
        remaining = remaining.saturating_sub(tick);

        let snapshot = store.load();
        if snapshot.configuration_mode != baseline.configuration_mode {
            return DelayOutcome::ModeChanged;
        }
        if snapshot.configuration_mode_interval != total {
            return DelayOutcome::IntervalChanged(snapshot.configuration_mode_interval);
        }
    }
}

/// The LCM worker
pub struct Worker {
    store: Arc<SettingsStore>,
    enforcer: Arc<dyn Enforcer>,
    source: Option<Arc<dyn BundleSource>>,
    cancel: CancellationToken,
    poll: Duration,
}

impl Worker {
    pub fn new(
        store: Arc<SettingsStore>,
        enforcer: Arc<dyn Enforcer>,
        source: Option<Arc<dyn BundleSource>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            enforcer,
            source,
            cancel,
            poll: DEFAULT_POLL,
        }
    }

    /// Override the delay poll tick (tests)
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Run until cancelled
    pub async fn run(&self) -> Result<()> {
        tracing::info!(mode = %self.store.load().configuration_mode, "worker starting");
        let mut previous_cycle_failed = false;

        'main: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let settings = self.store.load();

            match self.run_cycle(&settings).await {
                Ok(outcome) => {
                    if previous_cycle_failed {
                        tracing::info!(event = EVENT_CYCLE_RECOVERED, "cycle succeeded again");
                        previous_cycle_failed = false;
                    }
                    tracing::debug!(?outcome, "cycle finished");
                }
                Err(Error::Cancelled(_)) => break,
                Err(error) => {
                    tracing::error!(event = EVENT_CYCLE_FAILED, %error, "cycle failed");
                    previous_cycle_failed = true;

                    // Back off, but never tighter than the configured
                    // interval allows.
                    let backoff = settings.configuration_mode_interval.min(MAX_BACKOFF);
                    match interruptible_delay(&self.store, &self.cancel, &settings, backoff, self.poll)
                        .await
                    {
                        DelayOutcome::Cancelled => break,
                        _ => continue 'main,
                    }
                }
            }

            // Scheduled wait; an interval change re-arms the wait, a mode
            // change re-enters the loop immediately.
            let mut total = self.store.load().configuration_mode_interval;
            loop {
                match interruptible_delay(&self.store, &self.cancel, &settings, total, self.poll).await
                {
                    DelayOutcome::Elapsed => break,
                    DelayOutcome::IntervalChanged(new_interval) => {
                        tracing::info!(
                            interval_seconds = new_interval.as_secs(),
                            "interval changed, rescheduling"
                        );
                        total = new_interval;
                    }
                    DelayOutcome::ModeChanged => {
                        tracing::info!(
                            mode = %self.store.load().configuration_mode,
                            "configuration mode changed, re-entering loop"
                        );
                        continue 'main;
                    }
                    DelayOutcome::Cancelled => break 'main,
                }
            }
        }

        tracing::info!("worker stopped");
        Ok(())
    }

    /// Resolve the configuration path for this cycle
    async fn resolve_path(&self, settings: &LcmSettings) -> Result<Option<PathBuf>> {
        match settings.configuration_source {
            ConfigurationSource::Local => Ok(Some(settings.configuration_path.clone())),
            ConfigurationSource::Pull => {
                let source = self.source.as_ref().ok_or_else(|| {
                    Error::Validation("pull source configured but no client available".into())
                })?;
                match source.refresh().await {
                    Ok(path) => Ok(Some(path)),
                    // Network and integrity failures are soft: report and
                    // proceed next interval.
                    Err(error) if error.is_transient() || error.is_integrity() => {
                        tracing::warn!(%error, "pull refresh failed, skipping cycle");
                        Ok(None)
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    async fn run_cycle(&self, settings: &LcmSettings) -> Result<CycleOutcome> {
        // Credential rotation runs ahead of the cycle proper.
        if settings.configuration_source == ConfigurationSource::Pull {
            if let Some(source) = &self.source {
                if let Err(error) = source.rotate_if_due().await {
                    tracing::warn!(%error, "certificate rotation failed, continuing");
                }
            }
        }

        let Some(path) = self.resolve_path(settings).await? else {
            return Ok(CycleOutcome::SkippedPullFailure);
        };
        if !path.exists() {
            tracing::warn!(path = %path.display(), "configuration file does not exist, skipping");
            return Ok(CycleOutcome::SkippedMissingFile);
        }

        let test = self.run_operation(OperationKind::Test, &path, settings).await?;
        let all_in_desired = test.result.all_in_desired_state();

        match settings.configuration_mode {
            ConfigurationMode::Monitor => {
                tracing::info!(in_desired_state = all_in_desired, "monitor cycle finished");
                Ok(CycleOutcome::Completed {
                    in_desired_state: all_in_desired,
                })
            }
            ConfigurationMode::Remediate => {
                if all_in_desired {
                    tracing::info!("all resources in desired state, nothing to remediate");
                    return Ok(CycleOutcome::Completed {
                        in_desired_state: true,
                    });
                }

                // Check-to-use guard: if the resolved path changed while the
                // test ran, skip set and let the next cycle start over.
                let current = self.store.load();
                let path_after = match current.configuration_source {
                    ConfigurationSource::Local => current.configuration_path.clone(),
                    ConfigurationSource::Pull => path.clone(),
                };
                if current.configuration_source != settings.configuration_source
                    || path_after != path
                {
                    tracing::warn!(
                        "configuration path changed during test, skipping set this cycle"
                    );
                    return Ok(CycleOutcome::SkippedPathChanged);
                }

                let set = self.run_operation(OperationKind::Set, &path, settings).await?;
                let succeeded = set.result.set_succeeded();
                tracing::info!(
                    succeeded,
                    restart_required = set.result.restart_required(),
                    "remediation finished"
                );
                Ok(CycleOutcome::Completed {
                    in_desired_state: succeeded,
                })
            }
        }
    }

    /// Run one operation and submit its report when enabled
    async fn run_operation(
        &self,
        operation: OperationKind,
        path: &std::path::Path,
        settings: &LcmSettings,
    ) -> Result<Execution> {
        let started_at = Utc::now();
        let execution = self.enforcer.run(operation, path, &self.cancel).await?;
        let ended_at = Utc::now();

        let report_enabled = settings
            .pull_server
            .as_ref()
            .map(|p| p.report_compliance)
            .unwrap_or(false);
        if report_enabled && settings.configuration_source == ConfigurationSource::Pull {
            if let Some(source) = &self.source {
                let in_desired_state = match operation {
                    OperationKind::Test => execution.result.all_in_desired_state(),
                    OperationKind::Set => execution.result.set_succeeded(),
                };
                let report = ComplianceReportRequest {
                    operation,
                    exit_code: execution.exit_code,
                    in_desired_state,
                    started_at,
                    ended_at,
                    result: execution.result.clone(),
                };
                if let Err(error) = source.submit_report(&report).await {
                    tracing::warn!(%error, "report submission failed");
                }
            }
        }

        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockEnforcer;
    use crate::pull::MockBundleSource;
    use opendsc_core::dsc::{DscResult, ResourceResult, ResourceState, ResultMetadata};

    fn settings(mode: ConfigurationMode, interval: Duration) -> LcmSettings {
        let mut settings = LcmSettings::default();
        settings.configuration_mode = mode;
        settings.configuration_mode_interval = interval;
        settings
    }

    fn result(in_desired: &[Option<bool>], had_errors: bool) -> DscResult {
        DscResult {
            exit_code: 0,
            results: in_desired
                .iter()
                .enumerate()
                .map(|(index, state)| ResourceResult {
                    resource_type: "Test/Resource".into(),
                    name: format!("r{}", index),
                    result: ResourceState {
                        in_desired_state: *state,
                        changed_properties: Vec::new(),
                        extra: Default::default(),
                    },
                })
                .collect(),
            metadata: ResultMetadata::default(),
            had_errors,
        }
    }

    fn execution(in_desired: &[Option<bool>]) -> Execution {
        Execution {
            result: result(in_desired, false),
            exit_code: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_elapses() {
        let store = SettingsStore::new(settings(ConfigurationMode::Monitor, Duration::from_secs(900)));
        let baseline = store.load();
        let cancel = CancellationToken::new();

        let outcome = interruptible_delay(
            &store,
            &cancel,
            &baseline,
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome, DelayOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_reacts_to_mode_change_within_one_tick() {
        let store = Arc::new(SettingsStore::new(settings(
            ConfigurationMode::Monitor,
            Duration::from_secs(900),
        )));
        let baseline = store.load();
        let cancel = CancellationToken::new();

        // Flip the mode shortly after the delay starts.
        let flipper = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            flipper.publish(settings(ConfigurationMode::Remediate, Duration::from_secs(900)));
        });

        let start = tokio::time::Instant::now();
        let outcome = interruptible_delay(
            &store,
            &cancel,
            &baseline,
            Duration::from_secs(900),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(outcome, DelayOutcome::ModeChanged);
        // Reaction within one poll tick of the change.
        assert!(start.elapsed() <= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_reports_interval_change() {
        let store = Arc::new(SettingsStore::new(settings(
            ConfigurationMode::Monitor,
            Duration::from_secs(900),
        )));
        let baseline = store.load();
        let cancel = CancellationToken::new();

        let flipper = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1100)).await;
            flipper.publish(settings(ConfigurationMode::Monitor, Duration::from_secs(60)));
        });

        let outcome = interruptible_delay(
            &store,
            &cancel,
            &baseline,
            Duration::from_secs(900),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome, DelayOutcome::IntervalChanged(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_cancellation() {
        let store = SettingsStore::new(settings(ConfigurationMode::Monitor, Duration::from_secs(900)));
        let baseline = store.load();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = interruptible_delay(
            &store,
            &cancel,
            &baseline,
            Duration::from_secs(900),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome, DelayOutcome::Cancelled);
    }

    fn local_settings(mode: ConfigurationMode, path: &std::path::Path) -> LcmSettings {
        let mut s = settings(mode, Duration::from_secs(900));
        s.configuration_path = path.to_path_buf();
        s
    }

    #[tokio::test]
    async fn test_monitor_cycle_runs_test_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.dsc.yaml");
        std::fs::write(&config, "resources: []\n").unwrap();

        let mut enforcer = MockEnforcer::new();
        enforcer
            .expect_run()
            .withf(|op, _, _| *op == OperationKind::Test)
            .times(1)
            .returning(|_, _, _| Ok(execution(&[Some(true)])));

        let store = Arc::new(SettingsStore::new(local_settings(
            ConfigurationMode::Monitor,
            &config,
        )));
        let worker = Worker::new(store.clone(), Arc::new(enforcer), None, CancellationToken::new());

        let outcome = worker.run_cycle(&store.load()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Completed { in_desired_state: true });
    }

    #[tokio::test]
    async fn test_remediate_runs_set_on_drift() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.dsc.yaml");
        std::fs::write(&config, "resources: []\n").unwrap();

        let mut enforcer = MockEnforcer::new();
        let mut sequence = mockall::Sequence::new();
        enforcer
            .expect_run()
            .withf(|op, _, _| *op == OperationKind::Test)
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(execution(&[Some(false)])));
        enforcer
            .expect_run()
            .withf(|op, _, _| *op == OperationKind::Set)
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(execution(&[Some(true)])));

        let store = Arc::new(SettingsStore::new(local_settings(
            ConfigurationMode::Remediate,
            &config,
        )));
        let worker = Worker::new(store.clone(), Arc::new(enforcer), None, CancellationToken::new());

        let outcome = worker.run_cycle(&store.load()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Completed { in_desired_state: true });
    }

    #[tokio::test]
    async fn test_remediate_skips_set_when_already_converged() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.dsc.yaml");
        std::fs::write(&config, "resources: []\n").unwrap();

        let mut enforcer = MockEnforcer::new();
        enforcer
            .expect_run()
            .withf(|op, _, _| *op == OperationKind::Test)
            .times(1)
            .returning(|_, _, _| Ok(execution(&[Some(true)])));

        let store = Arc::new(SettingsStore::new(local_settings(
            ConfigurationMode::Remediate,
            &config,
        )));
        let worker = Worker::new(store.clone(), Arc::new(enforcer), None, CancellationToken::new());

        let outcome = worker.run_cycle(&store.load()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Completed { in_desired_state: true });
    }

    #[tokio::test]
    async fn test_remediate_null_state_counts_as_drift() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.dsc.yaml");
        std::fs::write(&config, "resources: []\n").unwrap();

        let mut enforcer = MockEnforcer::new();
        let mut sequence = mockall::Sequence::new();
        enforcer
            .expect_run()
            .withf(|op, _, _| *op == OperationKind::Test)
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(execution(&[Some(true), None])));
        enforcer
            .expect_run()
            .withf(|op, _, _| *op == OperationKind::Set)
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _, _| Ok(execution(&[Some(true), Some(true)])));

        let store = Arc::new(SettingsStore::new(local_settings(
            ConfigurationMode::Remediate,
            &config,
        )));
        let worker = Worker::new(store.clone(), Arc::new(enforcer), None, CancellationToken::new());

        let outcome = worker.run_cycle(&store.load()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Completed { in_desired_state: true });
    }

    #[tokio::test]
    async fn test_remediate_skips_set_when_path_changes_during_test() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.dsc.yaml");
        std::fs::write(&config, "resources: []\n").unwrap();
        let other = dir.path().join("other.dsc.yaml");
        std::fs::write(&other, "resources: []\n").unwrap();

        let store = Arc::new(SettingsStore::new(local_settings(
            ConfigurationMode::Remediate,
            &config,
        )));

        // The test result arrives after the path flipped underneath us.
        let flip_store = Arc::clone(&store);
        let flip_path = other.clone();
        let mut enforcer = MockEnforcer::new();
        enforcer
            .expect_run()
            .withf(|op, _, _| *op == OperationKind::Test)
            .times(1)
            .returning(move |_, _, _| {
                flip_store.publish(local_settings(ConfigurationMode::Remediate, &flip_path));
                Ok(execution(&[Some(false)]))
            });

        let worker = Worker::new(store.clone(), Arc::new(enforcer), None, CancellationToken::new());
        let outcome = worker.run_cycle(&store.load()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::SkippedPathChanged);
    }

    #[tokio::test]
    async fn test_missing_file_skips_cycle() {
        let store = Arc::new(SettingsStore::new(local_settings(
            ConfigurationMode::Monitor,
            std::path::Path::new("/nonexistent/config.dsc.yaml"),
        )));
        let enforcer = MockEnforcer::new(); // must not be called

        let worker = Worker::new(store.clone(), Arc::new(enforcer), None, CancellationToken::new());
        let outcome = worker.run_cycle(&store.load()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::SkippedMissingFile);
    }

    #[tokio::test]
    async fn test_pull_soft_failure_skips_cycle() {
        let mut settings = settings(ConfigurationMode::Monitor, Duration::from_secs(900));
        settings.configuration_source = ConfigurationSource::Pull;
        settings.pull_server = Some(crate::settings::PullServerSettings {
            server_url: "https://pull.example".into(),
            registration_key: "rk_x_y".into(),
            report_compliance: true,
            certificate_source: crate::settings::CertificateSource::Managed,
            certificate_thumbprint: None,
            certificate_path: None,
            certificate_password: None,
        });

        let mut source = MockBundleSource::new();
        source.expect_rotate_if_due().returning(|| Ok(()));
        source
            .expect_refresh()
            .times(1)
            .returning(|| Err(Error::TransientIo("connection refused".into())));

        let store = Arc::new(SettingsStore::new(settings));
        let worker = Worker::new(
            store.clone(),
            Arc::new(MockEnforcer::new()),
            Some(Arc::new(source)),
            CancellationToken::new(),
        );

        let outcome = worker.run_cycle(&store.load()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::SkippedPullFailure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_switch_mid_delay_reenters_loop() {
        // Scenario: Monitor with a long interval; mid-delay the mode flips
        // to Remediate; the worker leaves the delay and runs test then set.
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.dsc.yaml");
        std::fs::write(&config, "resources: []\n").unwrap();

        let store = Arc::new(SettingsStore::new(local_settings(
            ConfigurationMode::Monitor,
            &config,
        )));
        let cancel = CancellationToken::new();

        let (cycle_tx, mut cycle_rx) = tokio::sync::mpsc::unbounded_channel::<OperationKind>();

        let mut enforcer = MockEnforcer::new();
        let tx = cycle_tx.clone();
        enforcer.expect_run().returning(move |op, _, _| {
            tx.send(op).unwrap();
            match op {
                OperationKind::Test => Ok(execution(&[Some(false)])),
                OperationKind::Set => Ok(execution(&[Some(true)])),
            }
        });

        let worker = Worker::new(store.clone(), Arc::new(enforcer), None, cancel.clone())
            .with_poll(Duration::from_millis(100));
        let handle = tokio::spawn(async move { worker.run().await });

        // First Monitor cycle runs test.
        assert_eq!(cycle_rx.recv().await.unwrap(), OperationKind::Test);

        // Ten "minutes" into the delay, flip the mode.
        tokio::time::sleep(Duration::from_secs(600)).await;
        store.publish(local_settings(ConfigurationMode::Remediate, &config));

        // The worker re-enters the loop in Remediate: test then set.
        assert_eq!(cycle_rx.recv().await.unwrap(), OperationKind::Test);
        assert_eq!(cycle_rx.recv().await.unwrap(), OperationKind::Set);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
