//! Progress reporting for the multi-phase build pipeline.
//!
//! Each build phase is handed a tracker whose `update_progress` increments
//! are expressed as a percentage of that phase.  Subtask trackers rescale
//! their increments into the parent's budget, so a phase worth 30% of the
//! whole that reports 50% done moves the root tracker by 15.

use tracing::{error, info};

use crate::errors::{GraphError, Result};

pub trait ProgressTracker {
    /// Describe what is currently being worked on.
    fn set_message(&self, msg: &str);
    /// Advance progress by `increment` percentage points of this tracker's
    /// own 0..100 scale.
    fn update_progress(&self, increment: f64);
    /// Report a fatal problem encountered while tracking.
    fn report_error(&self, msg: &str, err: &GraphError);
}

/// A tracker that owns `weight` percentage points of its parent.
pub struct SubtaskTracker<'a> {
    parent: &'a dyn ProgressTracker,
    weight: f64,
    label: String,
}

impl<'a> ProgressTracker for SubtaskTracker<'a> {
    fn set_message(&self, msg: &str) {
        self.parent.set_message(&format!("{}: {}", self.label, msg));
    }

    fn update_progress(&self, increment: f64) {
        self.parent.update_progress(increment * self.weight / 100.0);
    }

    fn report_error(&self, msg: &str, err: &GraphError) {
        self.parent
            .report_error(&format!("{}: {}", self.label, msg), err);
    }
}

/// Carve out `weight` percentage points of `parent` for a named subtask.
/// Subtasks nest; the scaling composes multiplicatively.
pub fn subtask<'a>(
    parent: &'a dyn ProgressTracker,
    weight: f64,
    label: impl Into<String>,
) -> SubtaskTracker<'a> {
    SubtaskTracker {
        parent,
        weight,
        label: label.into(),
    }
}

/// Run one phase of a pipeline under `tracker`, crediting `weight`
/// percentage points on success and reporting the error on failure.
pub fn run_phase<T>(
    tracker: &dyn ProgressTracker,
    msg: &str,
    weight: f64,
    phase: impl FnOnce() -> Result<T>,
) -> Result<T> {
    tracker.set_message(msg);
    match phase() {
        Ok(value) => {
            tracker.update_progress(weight);
            Ok(value)
        }
        Err(err) => {
            tracker.report_error(&format!("Failed {}", msg), &err);
            Err(err)
        }
    }
}

/// Tracker that forwards everything to the `tracing` subscriber.  Used by
/// the command-line tool and anywhere nobody is watching a progress bar.
#[derive(Default)]
pub struct LogTracker;

impl ProgressTracker for LogTracker {
    fn set_message(&self, msg: &str) {
        info!(progress_msg = msg);
    }

    fn update_progress(&self, increment: f64) {
        info!(progress_increment = increment);
    }

    fn report_error(&self, msg: &str, err: &GraphError) {
        error!(progress_msg = msg, error = %err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Records every call so tests can assert on the scaled values.
    #[derive(Default)]
    struct RecordingTracker {
        messages: RefCell<Vec<String>>,
        increments: RefCell<Vec<f64>>,
        errors: RefCell<Vec<String>>,
    }

    impl ProgressTracker for RecordingTracker {
        fn set_message(&self, msg: &str) {
            self.messages.borrow_mut().push(msg.to_string());
        }

        fn update_progress(&self, increment: f64) {
            self.increments.borrow_mut().push(increment);
        }

        fn report_error(&self, msg: &str, _err: &GraphError) {
            self.errors.borrow_mut().push(msg.to_string());
        }
    }

    #[test]
    fn subtask_scales_increments_into_parent_budget() {
        let root = RecordingTracker::default();
        let sub = subtask(&root, 30.0, "nodes");
        sub.update_progress(50.0);
        let increments = root.increments.borrow();
        assert_eq!(increments.len(), 1);
        assert!((increments[0] - 15.0).abs() < 1e-9);
    }

    #[test]
    fn subtask_scaling_composes_across_nesting() {
        let root = RecordingTracker::default();
        let outer = subtask(&root, 50.0, "build");
        let inner = subtask(&outer, 20.0, "edges");
        inner.update_progress(100.0);
        let increments = root.increments.borrow();
        assert!((increments[0] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn subtask_prefixes_messages_with_label() {
        let root = RecordingTracker::default();
        let outer = subtask(&root, 50.0, "build");
        let inner = subtask(&outer, 20.0, "edges");
        inner.set_message("folding");
        assert_eq!(root.messages.borrow()[0], "build: edges: folding");
    }

    #[test]
    fn run_phase_credits_weight_on_success() {
        let root = RecordingTracker::default();
        let out = run_phase(&root, "Normalizing names", 30.0, || Ok(7)).unwrap();
        assert_eq!(out, 7);
        assert_eq!(root.messages.borrow()[0], "Normalizing names");
        assert!((root.increments.borrow()[0] - 30.0).abs() < 1e-9);
    }

    #[test]
    fn run_phase_reports_prefixed_error_on_failure() {
        let root = RecordingTracker::default();
        let res: Result<()> = run_phase(&root, "Adding edges", 70.0, || {
            Err(GraphError::bad_input("cycle of woe"))
        });
        assert!(res.is_err());
        assert_eq!(root.errors.borrow()[0], "Failed Adding edges");
        assert!(root.increments.borrow().is_empty());
    }
}
