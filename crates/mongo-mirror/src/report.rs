//! Run observers: operator-facing progress and completion reporting.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::pipeline::{CollectionReport, CollectionStatus};
use crate::store::EndpointRole;

/// Receives progress events from a mirror run.
///
/// Every method has a no-op default so observers only implement what they
/// display.
pub trait MirrorObserver: Send + Sync {
    /// An endpoint connected and answered its ping.
    fn connected(&self, _role: EndpointRole) {}

    /// A collection transfer started.
    fn collection_started(&self, _name: &str) {}

    /// The source reported how many documents will be copied.
    fn collection_counted(&self, _name: &str, _matched: u64) {}

    /// The running copied count of a collection changed.
    fn documents_copied(&self, _name: &str, _copied: u64) {}

    /// A collection reached its final status.
    fn collection_finished(&self, _report: &CollectionReport) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentObserver;

impl MirrorObserver for SilentObserver {}

/// Observer writing start and finish lines through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl MirrorObserver for TracingObserver {
    fn connected(&self, role: EndpointRole) {
        info!("Successfully connected to {} database", role);
    }

    fn collection_started(&self, name: &str) {
        info!("Starting collection {}", name);
    }

    fn collection_finished(&self, report: &CollectionReport) {
        match &report.status {
            CollectionStatus::Completed => info!(
                "Collection {} imported successfully! Total: {}",
                report.name, report.copied
            ),
            status => warn!(
                "Collection {} {} after {} documents",
                report.name, status, report.copied
            ),
        }
    }
}

/// Observer drawing one progress bar per collection.
pub struct ProgressObserver {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressObserver {
    /// Creates an observer drawing to stderr.
    #[must_use]
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn line(&self, message: String) {
        if self.multi.println(&message).is_err() {
            eprintln!("{message}");
        }
    }
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl MirrorObserver for ProgressObserver {
    fn connected(&self, role: EndpointRole) {
        self.line(format!("Connected to {role} database"));
    }

    fn collection_started(&self, name: &str) {
        self.line(format!("---------- Starting collection {name} ----------"));
    }

    fn collection_counted(&self, name: &str, matched: u64) {
        let bar = self.multi.add(ProgressBar::new(matched));
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_prefix(name.to_string());
        self.bars.lock().insert(name.to_string(), bar);
    }

    fn documents_copied(&self, name: &str, copied: u64) {
        if let Some(bar) = self.bars.lock().get(name) {
            bar.set_position(copied);
        }
    }

    fn collection_finished(&self, report: &CollectionReport) {
        if let Some(bar) = self.bars.lock().remove(&report.name) {
            bar.finish_and_clear();
        }
        self.line(format!(
            "---------- Finished collection {}: {} ({} copied) ----------",
            report.name, report.status, report.copied
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl MirrorObserver for Recorder {
        fn collection_started(&self, name: &str) {
            self.events.lock().push(format!("start {name}"));
        }
    }

    #[test]
    fn test_default_methods_are_no_ops() {
        let recorder = Recorder::default();
        recorder.connected(EndpointRole::Source);
        recorder.collection_counted("orders", 3);
        recorder.documents_copied("orders", 1);
        recorder.collection_started("orders");
        assert_eq!(*recorder.events.lock(), vec!["start orders".to_string()]);
    }

    #[test]
    fn test_progress_observer_tracks_bars_per_collection() {
        let observer = ProgressObserver::new();
        observer.collection_counted("orders", 10);
        observer.documents_copied("orders", 4);
        assert_eq!(observer.bars.lock().get("orders").map(ProgressBar::position), Some(4));

        observer.collection_finished(&CollectionReport {
            name: "orders".to_string(),
            matched: Some(10),
            copied: 10,
            status: CollectionStatus::Completed,
            duration_secs: 0.5,
        });
        assert!(observer.bars.lock().is_empty());
    }
}
