//! Printer status snapshots returned by a poll.

use serde::{Deserialize, Serialize};

/// Coarse machine state as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineState {
    /// Idle and ready for a job.
    Ready,
    /// Printing a job.
    Printing,
    /// A job is paused.
    Paused,
    /// Heating up, usually ahead of a job.
    Heating,
    /// The last job finished.
    Completed,
    /// Calibrating, homing or otherwise occupied.
    Busy,
    /// The device reports a fault.
    Error,
    /// Unrecognized state string.
    #[default]
    Unknown,
}

/// Progress of the current job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    /// File name of the job.
    pub name: String,
    /// Completion in percent, 0.0 to 100.0.
    pub percent: f32,
    /// Current layer, when reported.
    pub layer: Option<u32>,
    /// Total layers, when reported.
    pub total_layers: Option<u32>,
}

/// One status reading of a printer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Machine state.
    pub state: MachineState,
    /// Current job, if any.
    pub job: Option<JobProgress>,
    /// Nozzle temperature in degrees Celsius.
    pub nozzle_temp: Option<f32>,
    /// Bed temperature in degrees Celsius.
    pub bed_temp: Option<f32>,
}

impl StatusSnapshot {
    /// Snapshot of an idle printer.
    pub fn idle() -> Self {
        Self {
            state: MachineState::Ready,
            ..Self::default()
        }
    }

    /// Snapshot of a printer running a job at the given progress.
    pub fn printing(name: impl Into<String>, percent: f32) -> Self {
        Self {
            state: MachineState::Printing,
            job: Some(JobProgress {
                name: name.into(),
                percent,
                ..JobProgress::default()
            }),
            ..Self::default()
        }
    }

    /// Whether a job is in progress, which drives the faster poll cadence.
    pub fn is_job_active(&self) -> bool {
        match self.state {
            MachineState::Printing | MachineState::Paused => true,
            MachineState::Heating => self.job.is_some(),
            _ => false,
        }
    }
}
