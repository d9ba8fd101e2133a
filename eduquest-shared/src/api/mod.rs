use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

pub mod endpoints;

// Auth
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthReq {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResp {
    pub token: String,
}

// Children
#[derive(Debug, Serialize, Deserialize)]
pub struct ChildDto {
    pub id: String,
    pub display_name: String,
    /// Whether the parent has filled out the preference form for this child.
    pub has_preferences: bool,
}

// Preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceDto {
    pub subject_id: String,
    pub difficulty: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreferenceWithSubjectDto {
    pub subject_id: String,
    pub subject_name: String,
    pub difficulty: i32,
}

/// Wholesale replacement of a child's preferences; ratings for subjects not
/// listed here (or listed with difficulty 0) are dropped.
#[derive(Debug, Serialize, Deserialize)]
pub struct SetPreferencesReq {
    pub preferences: Vec<PreferenceDto>,
}

// Tasks
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskCreateReq {
    pub subject_id: String,
    pub title: String,
    pub description: String,
    pub due_date: NaiveDate,
    pub time_minutes: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskDto {
    pub id: i32,
    pub subject_id: String,
    pub subject_name: String,
    pub title: String,
    pub description: String,
    pub due_date: NaiveDate,
    pub time_minutes: i32,
    pub status: TaskStatus,
    /// Recorded award for done tasks, 0 for overdue ones, otherwise the
    /// projected difficulty-based value.
    pub points: i32,
    pub started_at: Option<String>,  // RFC3339 UTC
    pub finished_at: Option<String>, // RFC3339 UTC
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskPageDto {
    pub items: Vec<TaskDto>,
    pub page: usize,
    pub total: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskListDto {
    pub started: TaskPageDto,
    pub todo: TaskPageDto,
    pub done: TaskPageDto,
    pub overdue: TaskPageDto,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartTaskResp {
    pub minutes: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PauseTaskReq {
    pub remaining_minutes: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinishTaskResp {
    pub awarded: i32,
}

/// Finishing ahead of schedule needs the parent to type their password.
#[derive(Debug, Serialize, Deserialize)]
pub struct FinishEarlyReq {
    pub password: String,
}

// Rewards
#[derive(Debug, Serialize, Deserialize)]
pub struct RewardCreateReq {
    pub name: String,
    pub points_required: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RewardUpdateReq {
    pub name: String,
    pub points_required: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RewardDto {
    pub id: i32,
    pub name: String,
    pub points_required: i32,
    pub is_active: bool,
    pub created_at: String, // RFC3339 UTC
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RewardProgressDto {
    pub reward: Option<RewardDto>,
    pub earned_points: i64,
    pub achieved: bool,
}

// Parent-facing overview of a single child
#[derive(Debug, Serialize, Deserialize)]
pub struct ChildOverviewDto {
    pub child: ChildDto,
    pub preferences: Vec<PreferenceWithSubjectDto>,
    pub tasks: Vec<TaskDto>,
    pub reward: RewardProgressDto,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteParentReq {
    pub password: String,
}
