use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task. `Done` and `Overdue` are terminal: a task
/// finished on time never becomes overdue, and an overdue task cannot be
/// started or finished anymore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    ToDo,
    Started,
    Done,
    Overdue,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::ToDo => "todo",
            TaskStatus::Started => "started",
            TaskStatus::Done => "done",
            TaskStatus::Overdue => "overdue",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct ParseTaskStatusError(String);

impl FromStr for TaskStatus {
    type Err = ParseTaskStatusError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(TaskStatus::ToDo),
            "started" => Ok(TaskStatus::Started),
            "done" => Ok(TaskStatus::Done),
            "overdue" => Ok(TaskStatus::Overdue),
            other => Err(ParseTaskStatusError(other.to_string())),
        }
    }
}

/// Per-subject difficulty a parent assigns to a child, 0..=5.
/// 0 means "not applicable"; such ratings are not persisted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Difficulty(pub i32);

impl Difficulty {
    pub const MAX: i32 = 5;

    pub fn new(value: i32) -> Option<Self> {
        (0..=Self::MAX).contains(&value).then_some(Difficulty(value))
    }

    pub fn zero() -> Self {
        Difficulty(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parent {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Child {
    pub id: String,
    pub parent_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
}
