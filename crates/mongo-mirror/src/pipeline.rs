//! Mirror orchestration: safety gate, connections and per-collection runs.

use futures::future::{AbortHandle, Abortable};
use futures::stream::{self, StreamExt};
use mongodb::bson::Document;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{CollectionSpec, MirrorSettings};
use crate::error::{Error, Result};
use crate::filter::FilterBuilder;
use crate::report::{MirrorObserver, TracingObserver};
use crate::retry::RetryConfig;
use crate::safety::{DestinationGuard, HostSuffixGuard};
use crate::source::{resolve_limit, SourceReader};
use crate::store::{DocumentStore, EndpointRole, StoreConnector};
use crate::writer::{DestinationWriter, TenantStamp, WriteMode};

/// Lifecycle of a [`Mirror`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    /// No connection opened yet.
    Unconnected,
    /// Both endpoints are being connected.
    Connecting,
    /// Both endpoints answered their ping.
    Connected,
    /// Transferring collection `index` of `total` (0-based).
    Running {
        /// Position of the most recently started collection.
        index: usize,
        /// Number of configured collections.
        total: usize,
    },
    /// The run finished, whatever its outcome.
    Done,
}

/// Final status of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionStatus {
    /// Every matched document was copied.
    Completed,
    /// The transfer stopped on an error.
    Failed(String),
    /// The run deadline expired during the transfer.
    TimedOut,
    /// Abandoned because another collection stopped the run.
    Cancelled,
    /// Never started because the run had already stopped.
    Skipped,
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

/// Outcome of one collection transfer.
#[derive(Debug, Clone)]
pub struct CollectionReport {
    /// Collection name.
    pub name: String,
    /// Documents the source reported, if the count ran.
    pub matched: Option<u64>,
    /// Documents written (or read, in a dry run).
    pub copied: u64,
    /// Final status.
    pub status: CollectionStatus,
    /// Duration in seconds.
    pub duration_secs: f64,
}

impl CollectionReport {
    fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            matched: None,
            copied: 0,
            status: CollectionStatus::Skipped,
            duration_secs: 0.0,
        }
    }

    /// Whether the collection completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == CollectionStatus::Completed
    }

    /// Calculate throughput (documents per second).
    #[must_use]
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.copied as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// Outcome of a whole run, one entry per configured collection in
/// configuration order.
#[derive(Debug, Clone, Default)]
pub struct MirrorReport {
    /// Per-collection outcomes.
    pub collections: Vec<CollectionReport>,
    /// Whether the run deadline expired.
    pub timed_out: bool,
    /// Duration in seconds, connections included.
    pub duration_secs: f64,
}

impl MirrorReport {
    /// True when every collection completed within the deadline.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.collections.iter().all(CollectionReport::is_completed)
    }

    /// Documents copied across all collections.
    #[must_use]
    pub fn total_copied(&self) -> u64 {
        self.collections.iter().map(|c| c.copied).sum()
    }

    /// Collections that did not complete.
    pub fn failed(&self) -> impl Iterator<Item = &CollectionReport> {
        self.collections.iter().filter(|c| !c.is_completed())
    }
}

/// What a run would do for one collection.
#[derive(Debug, Clone)]
pub struct CollectionPlan {
    /// Collection name.
    pub name: String,
    /// Normalized source filter.
    pub filter: Document,
    /// Document cap, `None` for all.
    pub limit: Option<u64>,
    /// Write strategy.
    pub mode: WriteMode,
}

#[derive(Clone)]
struct Connections {
    source: Arc<dyn DocumentStore>,
    destination: Arc<dyn DocumentStore>,
}

/// Mirrors the configured collections from source to destination.
pub struct Mirror {
    settings: MirrorSettings,
    connector: Arc<dyn StoreConnector>,
    guards: Vec<Box<dyn DestinationGuard>>,
    observer: Arc<dyn MirrorObserver>,
    retry: RetryConfig,
    stamp: Option<TenantStamp>,
    state: Mutex<MirrorState>,
    connections: Option<Connections>,
}

impl Mirror {
    /// Create a mirror for validated `settings`.
    ///
    /// The production host guard is always installed, extended with
    /// `options.forbidden_hosts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings do not validate.
    pub fn new(settings: MirrorSettings, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        settings.validate()?;

        let options = &settings.config.options;
        let guard = HostSuffixGuard::new(&options.forbidden_hosts);
        let retry = RetryConfig::with_max_retries(options.max_retries);
        let stamp = settings
            .config
            .tenant_destination
            .as_deref()
            .map(|tenant| TenantStamp::new(options.tenant_field.clone(), tenant))
            .transpose()?;

        Ok(Self {
            settings,
            connector,
            guards: vec![Box::new(guard)],
            observer: Arc::new(TracingObserver),
            retry,
            stamp,
            state: Mutex::new(MirrorState::Unconnected),
            connections: None,
        })
    }

    /// Replaces the observer receiving progress events.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn MirrorObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Adds a destination guard. Guards only accumulate.
    #[must_use]
    pub fn with_guard(mut self, guard: Box<dyn DestinationGuard>) -> Self {
        self.guards.push(guard);
        self
    }

    /// Replaces the backoff used for idempotent store calls.
    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MirrorState {
        *self.state.lock()
    }

    /// Settings this mirror runs with.
    #[must_use]
    pub fn settings(&self) -> &MirrorSettings {
        &self.settings
    }

    fn set_state(&self, state: MirrorState) {
        debug!("Mirror state: {:?}", state);
        *self.state.lock() = state;
    }

    fn check_destination(&self) -> Result<()> {
        let destination = &self.settings.config.destination;
        for guard in &self.guards {
            guard.check(destination)?;
        }
        Ok(())
    }

    /// Checks the destination and builds every collection plan without
    /// connecting.
    ///
    /// # Errors
    ///
    /// Returns the first safety, filter or batch-size error.
    pub fn preflight(&self) -> Result<Vec<CollectionPlan>> {
        self.check_destination()?;

        let builder = self.filter_builder();
        let dry_run = self.settings.config.options.dry_run;
        self.settings
            .collections
            .iter()
            .map(|spec| -> Result<CollectionPlan> {
                Ok(CollectionPlan {
                    name: spec.name.clone(),
                    filter: builder.build(spec)?,
                    limit: resolve_limit(&spec.name, spec.batch_size.as_deref())?,
                    mode: WriteMode::for_collection(spec, dry_run),
                })
            })
            .collect()
    }

    /// Connects both endpoints concurrently, after the destination guards
    /// have accepted the destination.
    ///
    /// Does nothing when already connected.
    ///
    /// # Errors
    ///
    /// [`Error::SafetyViolation`] before any connection attempt, or
    /// [`Error::Connection`] if either endpoint fails.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connections.is_some() {
            return Ok(());
        }

        self.check_destination()?;
        self.set_state(MirrorState::Connecting);

        let config = &self.settings.config;
        let timeout = config.options.connect_timeout();
        info!(
            "Connecting to source {} and destination {}",
            config.source.redacted(),
            config.destination.redacted()
        );

        let connected = tokio::try_join!(
            self.connector
                .connect(EndpointRole::Source, &config.source, timeout),
            self.connector
                .connect(EndpointRole::Destination, &config.destination, timeout),
        );

        match connected {
            Ok((source, destination)) => {
                self.observer.connected(EndpointRole::Source);
                self.observer.connected(EndpointRole::Destination);
                self.connections = Some(Connections {
                    source,
                    destination,
                });
                self.set_state(MirrorState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(MirrorState::Unconnected);
                Err(e)
            }
        }
    }

    /// Runs every configured collection and reports the outcome.
    ///
    /// Collection failures are reported, not returned.
    ///
    /// # Errors
    ///
    /// Returns an error only for run-fatal conditions met before any
    /// transfer starts (safety gate, connection).
    pub async fn run(&mut self) -> Result<MirrorReport> {
        let start = Instant::now();
        info!(
            "Starting mirror of {} collections",
            self.settings.collections.len()
        );

        self.connect().await?;
        let connections = self
            .connections
            .clone()
            .ok_or_else(|| Error::Config("mirror is not connected".to_string()))?;

        let (collections, timed_out) = self.transfer_all(&connections).await;
        self.set_state(MirrorState::Done);

        let report = MirrorReport {
            collections,
            timed_out,
            duration_secs: start.elapsed().as_secs_f64(),
        };
        info!(
            "Mirror finished: {} documents copied, {} collections not completed in {:.2}s",
            report.total_copied(),
            report.failed().count(),
            report.duration_secs
        );
        Ok(report)
    }

    fn filter_builder(&self) -> FilterBuilder<'_> {
        let config = &self.settings.config;
        FilterBuilder::new(
            &config.tenants,
            &config.options.tenant_field,
            config.options.filter_precedence,
        )
    }

    async fn transfer_all(&self, connections: &Connections) -> (Vec<CollectionReport>, bool) {
        let options = &self.settings.config.options;
        let total = self.settings.collections.len();
        let deadline = tokio::time::Instant::now() + self.settings.config.run_timeout();
        let builder = self.filter_builder();

        let (handles, registrations): (Vec<_>, Vec<_>) =
            (0..total).map(|_| AbortHandle::new_pair()).unzip();
        let stopped = AtomicBool::new(false);
        let timed_out = AtomicBool::new(false);

        let stop = || {
            stopped.store(true, Ordering::SeqCst);
            for handle in &handles {
                handle.abort();
            }
        };
        let stop = &stop;
        let (builder, stopped_ref, timed_out_ref) = (&builder, &stopped, &timed_out);

        let reports = stream::iter(
            self.settings
                .collections
                .iter()
                .zip(registrations)
                .enumerate(),
        )
        .map(|(index, (spec, registration))| async move {
            if stopped_ref.load(Ordering::SeqCst) {
                let report = CollectionReport::skipped(&spec.name);
                self.observer.collection_finished(&report);
                return report;
            }

            self.set_state(MirrorState::Running { index, total });
            self.observer.collection_started(&spec.name);
            let started = Instant::now();
            let matched = OnceLock::new();
            let copied = AtomicU64::new(0);

            let transfer = tokio::time::timeout_at(
                deadline,
                self.transfer(spec, builder, connections, &matched, &copied),
            );

            let status = match Abortable::new(transfer, registration).await {
                Ok(Ok(Ok(_))) => CollectionStatus::Completed,
                Ok(Ok(Err(e))) => {
                    warn!("Collection {} failed: {}", spec.name, e);
                    if e.is_run_fatal() || !options.continue_on_error {
                        stop();
                    }
                    CollectionStatus::Failed(e.to_string())
                }
                Ok(Err(_elapsed)) => {
                    warn!(
                        "Collection {} exceeded the {}s run deadline",
                        spec.name,
                        self.settings.config.run_timeout().as_secs()
                    );
                    timed_out_ref.store(true, Ordering::SeqCst);
                    stop();
                    CollectionStatus::TimedOut
                }
                Err(_aborted) => CollectionStatus::Cancelled,
            };

            let report = CollectionReport {
                name: spec.name.clone(),
                matched: matched.get().copied(),
                copied: copied.load(Ordering::SeqCst),
                status,
                duration_secs: started.elapsed().as_secs_f64(),
            };
            self.observer.collection_finished(&report);
            report
        })
        .buffered(options.effective_concurrency())
        .collect::<Vec<_>>()
        .await;

        (reports, timed_out.load(Ordering::SeqCst))
    }

    async fn transfer(
        &self,
        spec: &CollectionSpec,
        builder: &FilterBuilder<'_>,
        connections: &Connections,
        matched: &OnceLock<u64>,
        copied: &AtomicU64,
    ) -> Result<u64> {
        let options = &self.settings.config.options;
        let filter = builder.build(spec)?;

        let opened = SourceReader::new(connections.source.as_ref(), &self.retry)
            .open(spec, &filter)
            .await?;
        let _ = matched.set(opened.matched);
        self.observer.collection_counted(&spec.name, opened.matched);

        let mode = WriteMode::for_collection(spec, options.dry_run);
        if mode == WriteMode::DryRun {
            info!("Dry run mode - not writing collection {}", spec.name);
        }

        DestinationWriter::new(
            connections.destination.as_ref(),
            &options.id_field,
            &self.retry,
        )
        .with_stamp(self.stamp.as_ref())
        .with_observer(self.observer.as_ref())
        .drain(&spec.name, mode, opened.cursor, copied)
        .await
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
