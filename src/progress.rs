//! Status callbacks and percent-complete reporting for a running export.

use std::{error::Error as StdError, fmt};

use log::{error, info};

/// Callback interface used to report the progress and problems of an export.
///
/// Implement this trait when you want to surface export status to your users.
pub trait ExportStatus: fmt::Debug {
    /// A collection is about to be exported.
    fn start_collection(&self, path: &str);

    /// A document is about to be exported.
    ///
    /// # Arguments
    ///
    /// * `name` - The document's file name
    /// * `current` - Zero-based index of the document within its collection
    /// * `total` - Number of documents in the collection
    fn start_document(&self, name: &str, current: u64, total: u64);

    /// A recoverable or fatal problem occurred. Fatal messages carry the
    /// `EXPORT:` prefix.
    fn error(&self, message: &str, cause: Option<&dyn StdError>);

    /// Polled between items; returning `true` aborts the current traversal.
    fn should_terminate(&self) -> bool {
        false
    }
}

/// A status callback showing nothing at all.
#[derive(Clone, Copy, Debug)]
pub struct NoStatus;

impl ExportStatus for NoStatus {
    fn start_collection(&self, _path: &str) {}
    fn start_document(&self, _name: &str, _current: u64, _total: u64) {}
    fn error(&self, _message: &str, _cause: Option<&dyn StdError>) {}
}

/// A status callback which only logs what it is told.
#[derive(Clone, Copy, Debug)]
pub struct LogStatus;

impl ExportStatus for LogStatus {
    fn start_collection(&self, path: &str) {
        info!("exporting collection {path}");
    }

    fn start_document(&self, name: &str, current: u64, total: u64) {
        info!("exporting document {name} ({}/{total})", current + 1);
    }

    fn error(&self, message: &str, cause: Option<&dyn StdError>) {
        match cause {
            Some(cause) => error!("{message}: {cause}"),
            None => error!("{message}"),
        }
    }
}

/// An attached management agent receiving integer percent-complete updates.
pub trait PercentMonitor: fmt::Debug {
    /// Report the current percent-complete value.
    fn set_percent(&self, percent: i32);
}

/// A monitor ignoring all percent updates.
#[derive(Clone, Copy, Debug)]
pub struct NoPercent;

impl PercentMonitor for NoPercent {
    fn set_percent(&self, _percent: i32) {}
}

/// Tracks traversal progress and pushes percent values to a monitor, but only
/// when the integer value actually changes.
#[derive(Debug, Default)]
pub(crate) struct PercentTracker {
    total: u64,
    seen: u64,
    last: Option<i32>,
}

impl PercentTracker {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total,
            seen: 0,
            last: None,
        }
    }

    pub(crate) fn advance(&mut self, monitor: Option<&dyn PercentMonitor>) {
        let percent = (100 * (self.seen + 1) / (self.total + 1)) as i32;
        self.seen += 1;
        if let Some(monitor) = monitor {
            if self.last != Some(percent) {
                monitor.set_percent(percent);
                self.last = Some(percent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Debug, Default)]
    struct Recording(RefCell<Vec<i32>>);

    impl PercentMonitor for Recording {
        fn set_percent(&self, percent: i32) {
            self.0.borrow_mut().push(percent);
        }
    }

    #[test]
    fn test_percent_updates_only_on_change() {
        let monitor = Recording::default();
        let mut tracker = PercentTracker::new(3);
        for _ in 0..3 {
            tracker.advance(Some(&monitor));
        }
        assert_eq!(*monitor.0.borrow(), vec![25, 50, 75]);
    }

    #[test]
    fn test_percent_deduplicates_large_totals() {
        let monitor = Recording::default();
        let mut tracker = PercentTracker::new(999);
        for _ in 0..999 {
            tracker.advance(Some(&monitor));
        }
        let reported = monitor.0.borrow();
        let mut deduped = reported.clone();
        deduped.dedup();
        assert_eq!(*reported, deduped, "repeated values must not be re-sent");
        assert_eq!(reported.last(), Some(&99));
    }

    #[test]
    fn test_empty_database_reports_one_hundred() {
        let monitor = Recording::default();
        let mut tracker = PercentTracker::new(0);
        tracker.advance(Some(&monitor));
        assert_eq!(*monitor.0.borrow(), vec![100]);
    }
}
