use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one long-running remote job.
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `Completed` and `Failed` only ever leave through a reset to `Idle`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (_, JobStatus::Idle) => true,
            (JobStatus::Idle, JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Completed | JobStatus::Failed) => true,
            (current, next) => current == next && !current.is_terminal(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The two independent jobs the wizard follows.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// SSH bootstrap of the linuxmuster.net server.
    Bootstrap,
    /// The linuxmuster.net install playbook.
    Playbook,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Bootstrap => f.write_str("bootstrap"),
            JobKind::Playbook => f.write_str("install playbook"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub id: u64,
    pub text: String,
}

/// Append-only job output. Ids restart at 0 after [`OutputLog::clear`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputLog {
    next_id: u64,
    lines: Vec<LogLine>,
}

impl OutputLog {
    pub fn append<S: Into<String>>(&mut self, text: S) -> u64 {
        let id = self.next_id;
        self.lines.push(LogLine {
            id,
            text: text.into(),
        });
        self.next_id += 1;
        id
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.next_id = 0;
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    /// Lines appended after the line with id `seen`; everything if `None`.
    pub fn since(&self, seen: Option<u64>) -> &[LogLine] {
        match seen {
            None => &self.lines,
            Some(seen) => {
                let start = self.lines.partition_point(|line| line.id <= seen);
                &self.lines[start..]
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.lines.iter().map(|line| line.text.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_only_leave_through_idle() {
        use JobStatus::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Completed));
    }

    #[test]
    fn test_log_ids_follow_append_order_and_reset_on_clear() {
        let mut log = OutputLog::default();
        for n in 0..5 {
            assert_eq!(n, log.append(format!("line {n}")));
        }
        let ids: Vec<u64> = log.lines().iter().map(|l| l.id).collect();
        assert_eq!(vec![0, 1, 2, 3, 4], ids);

        log.clear();
        assert!(log.is_empty());
        assert_eq!(0, log.append("fresh"));
    }

    #[test]
    fn test_since_returns_only_unseen_lines() {
        let mut log = OutputLog::default();
        log.append("a");
        log.append("b");
        log.append("c");
        assert_eq!(3, log.since(None).len());
        let rest: Vec<&str> = log.since(Some(0)).iter().map(|l| l.text.as_str()).collect();
        assert_eq!(vec!["b", "c"], rest);
        assert!(log.since(Some(2)).is_empty());
    }
}
