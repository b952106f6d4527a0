use crate::calibrate::dataset::DatasetReport;

/// Observer for reporting incremental progress while a simulation sweep runs.
///
/// Methods take `&self` because one observer is shared by every parallel
/// calibration job; `job` identifies the sweep.
pub trait SweepProgress: Sync {
    fn on_sweep_start(&self, job: &str, total_trials: usize) {
        let _ = (job, total_trials);
    }
    fn on_sweep_advance(&self, job: &str, completed_trials: usize) {
        let _ = (job, completed_trials);
    }
    fn on_sweep_finish(&self, job: &str, report: &DatasetReport) {
        let _ = (job, report);
    }
}

#[derive(Default)]
pub struct NoopSweepProgress;

impl SweepProgress for NoopSweepProgress {}
