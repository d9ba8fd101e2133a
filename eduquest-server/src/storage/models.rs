use crate::storage::schema::{
    children, parents, points_entries, preferences, rewards, subjects, tasks,
};
use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use eduquest_shared::domain::TaskStatus;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = parents)]
pub struct Parent {
    pub id: String,
    pub display_name: String,
}

#[derive(Insertable)]
#[diesel(table_name = parents)]
pub struct NewParent<'a> {
    pub id: &'a str,
    pub display_name: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = children)]
#[diesel(belongs_to(Parent, foreign_key = parent_id))]
pub struct Child {
    pub id: String,
    pub parent_id: String,
    pub display_name: String,
}

#[derive(Insertable)]
#[diesel(table_name = children)]
pub struct NewChild<'a> {
    pub id: &'a str,
    pub parent_id: &'a str,
    pub display_name: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = subjects)]
pub struct Subject {
    pub id: String,
    pub name: String,
}

#[derive(Insertable)]
#[diesel(table_name = subjects)]
pub struct NewSubject<'a> {
    pub id: &'a str,
    pub name: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = preferences)]
#[diesel(belongs_to(Child, foreign_key = child_id))]
#[diesel(belongs_to(Subject, foreign_key = subject_id))]
pub struct Preference {
    pub id: i32,
    pub child_id: String,
    pub subject_id: String,
    pub difficulty: i32,
}

#[derive(Insertable)]
#[diesel(table_name = preferences)]
pub struct NewPreference<'a> {
    pub child_id: &'a str,
    pub subject_id: &'a str,
    pub difficulty: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = tasks)]
#[diesel(belongs_to(Child, foreign_key = child_id))]
#[diesel(belongs_to(Subject, foreign_key = subject_id))]
pub struct Task {
    pub id: i32,
    pub child_id: String,
    pub subject_id: String,
    pub title: String,
    pub description: String,
    pub due_date: NaiveDate,
    pub time_minutes: i32,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
}

impl Task {
    /// Status column parsed into the domain enum. The column only ever holds
    /// values written through `TaskStatus::as_str`, so a parse failure means
    /// a corrupted row; treat it as todo rather than panicking in reads.
    pub fn status(&self) -> TaskStatus {
        self.status.parse().unwrap_or(TaskStatus::ToDo)
    }
}

#[derive(Insertable)]
#[diesel(table_name = tasks)]
pub struct NewTask<'a> {
    pub child_id: &'a str,
    pub subject_id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub due_date: NaiveDate,
    pub time_minutes: i32,
    pub status: &'a str,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = points_entries)]
#[diesel(belongs_to(Task, foreign_key = task_id))]
pub struct PointsEntry {
    pub id: i32,
    pub child_id: String,
    pub task_id: i32,
    pub subject_id: String,
    pub points: i32,
    pub awarded_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = points_entries)]
pub struct NewPointsEntry<'a> {
    pub child_id: &'a str,
    pub task_id: i32,
    pub subject_id: &'a str,
    pub points: i32,
    pub awarded_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = rewards)]
#[diesel(belongs_to(Child, foreign_key = child_id))]
pub struct Reward {
    pub id: i32,
    pub child_id: String,
    pub name: String,
    pub points_required: i32,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = rewards)]
pub struct NewReward<'a> {
    pub child_id: &'a str,
    pub name: &'a str,
    pub points_required: i32,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
}
