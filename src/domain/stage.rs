//! Job identifiers and the staged job state machine.
//!
//! Stages advance strictly forward:
//!
//! ```text
//! PENDING -> PHASE1_PROCESSING -> PHASE1_DONE -> PHASE2_PROCESSING -> ... -> DONE
//!    \_____________________\______________________\____________________-> ERROR
//! ```
//!
//! `DONE` and `ERROR` are terminal. `ERROR` is reachable from any
//! non-terminal stage; `DONE` likewise, since a producer may finish without
//! reporting every phase.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier of a staged job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Stage of a staged job. Phases are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStage {
    Pending,
    Processing(u16),
    PhaseDone(u16),
    Done,
    Error,
}

impl JobStage {
    /// Position in the forward order. Terminal stages share the top slot.
    fn ordinal(&self) -> u64 {
        match self {
            JobStage::Pending => 0,
            JobStage::Processing(n) => u64::from(*n) * 2,
            JobStage::PhaseDone(n) => u64::from(*n) * 2 + 1,
            JobStage::Done | JobStage::Error => u64::MAX,
        }
    }

    /// Whether the stage is `Done` or `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Done | JobStage::Error)
    }

    /// Whether a job in this stage may move to `next`.
    ///
    /// Only strictly forward moves are accepted; a terminal stage accepts
    /// nothing, and `Processing(0)` is never valid.
    pub fn can_advance_to(&self, next: JobStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.ordinal() > self.ordinal()
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStage::Pending => f.write_str("PENDING"),
            JobStage::Processing(n) => write!(f, "PHASE{n}_PROCESSING"),
            JobStage::PhaseDone(n) => write!(f, "PHASE{n}_DONE"),
            JobStage::Done => f.write_str("DONE"),
            JobStage::Error => f.write_str("ERROR"),
        }
    }
}

/// Error returned when a stage name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job stage `{0}`")]
pub struct ParseStageError(String);

impl FromStr for JobStage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => return Ok(JobStage::Pending),
            "DONE" => return Ok(JobStage::Done),
            "ERROR" => return Ok(JobStage::Error),
            _ => {}
        }

        let phase = |rest: &str| rest.parse::<u16>().ok().filter(|n| *n > 0);
        s.strip_prefix("PHASE")
            .and_then(|rest| {
                if let Some(n) = rest.strip_suffix("_PROCESSING") {
                    phase(n).map(JobStage::Processing)
                } else if let Some(n) = rest.strip_suffix("_DONE") {
                    phase(n).map(JobStage::PhaseDone)
                } else {
                    None
                }
            })
            .ok_or_else(|| ParseStageError(s.to_string()))
    }
}

impl Serialize for JobStage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobStage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_progression() {
        let path = [
            JobStage::Pending,
            JobStage::Processing(1),
            JobStage::PhaseDone(1),
            JobStage::Processing(2),
            JobStage::PhaseDone(2),
            JobStage::Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert!(!pair[1].can_advance_to(pair[0]), "{} -> {}", pair[1], pair[0]);
        }
    }

    #[test]
    fn test_skipping_phases_is_allowed() {
        assert!(JobStage::Pending.can_advance_to(JobStage::PhaseDone(2)));
        assert!(JobStage::Processing(1).can_advance_to(JobStage::Done));
    }

    #[test]
    fn test_same_stage_is_not_an_advance() {
        assert!(!JobStage::Processing(1).can_advance_to(JobStage::Processing(1)));
    }

    #[test]
    fn test_error_reachable_from_any_non_terminal() {
        for stage in [JobStage::Pending, JobStage::Processing(3), JobStage::PhaseDone(7)] {
            assert!(stage.can_advance_to(JobStage::Error));
        }
    }

    #[test]
    fn test_terminal_stages_are_final() {
        for terminal in [JobStage::Done, JobStage::Error] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_advance_to(JobStage::Error));
            assert!(!terminal.can_advance_to(JobStage::Done));
            assert!(!terminal.can_advance_to(JobStage::Processing(9)));
        }
    }

    #[test]
    fn test_phase_zero_is_rejected() {
        assert!(!JobStage::Pending.can_advance_to(JobStage::Processing(0)));
        assert!("PHASE0_DONE".parse::<JobStage>().is_err());
    }

    #[test]
    fn test_display_and_parse() {
        for stage in [
            JobStage::Pending,
            JobStage::Processing(1),
            JobStage::PhaseDone(12),
            JobStage::Done,
            JobStage::Error,
        ] {
            assert_eq!(stage.to_string().parse::<JobStage>().unwrap(), stage);
        }
        assert_eq!(JobStage::Processing(2).to_string(), "PHASE2_PROCESSING");
        assert!("PHASE_DONE".parse::<JobStage>().is_err());
        assert!("RUNNING".parse::<JobStage>().is_err());
    }

    #[test]
    fn test_stage_serializes_as_name() {
        let json = serde_json::to_string(&JobStage::PhaseDone(1)).unwrap();
        assert_eq!(json, "\"PHASE1_DONE\"");
        let back: JobStage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, JobStage::PhaseDone(1));
    }

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert_ne!(JobId::new(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
