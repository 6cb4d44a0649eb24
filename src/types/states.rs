use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a job:
///
/// ```text
/// pending -> active -> completed
///    ^         |  \
///    +---------+   -> failed
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        use JobStatus::*;

        match self {
            Pending => "pending",
            Active => "active",
            Completed => "completed",
            Failed => "failed",
        }
    }

    /// Completed and failed jobs are never picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_become(&self, to: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, to),
            (Pending, Active)
                | (Active, Completed)
                | (Active, Pending)
                | (Active, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges() {
        use JobStatus::*;

        let all = [Pending, Active, Completed, Failed];
        let valid = [
            (Pending, Active),
            (Active, Completed),
            (Active, Pending),
            (Active, Failed),
        ];

        for from in all {
            for to in all {
                assert_eq!(
                    from.can_become(to),
                    valid.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use JobStatus::*;

        for from in [Completed, Failed] {
            assert!(from.is_terminal());
            for to in [Pending, Active, Completed, Failed] {
                assert!(!from.can_become(to));
            }
        }
    }

    #[test]
    fn test_serialises_lowercase() {
        assert_eq!(
            serde_yaml::to_string(&JobStatus::Completed).unwrap().trim(),
            "completed"
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"active\"").unwrap(),
            JobStatus::Active
        );
    }
}
