pub mod models;
pub mod schema;

use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use eduquest_shared::domain::{Difficulty, TaskStatus};
use eduquest_shared::points;
use models::{
    Child, NewChild, NewParent, NewPointsEntry, NewPreference, NewReward, NewSubject, NewTask,
    Preference, Reward, Task,
};

/// Structured error type for all storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A Diesel ORM error (query failure, constraint violation, etc.)
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Failed to acquire or build a connection from the pool.
    #[error("pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    /// A `spawn_blocking` task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A database migration failed to apply.
    #[error("migration error: {0}")]
    Migration(String),

    /// The caller supplied invalid input or requested an invalid transition.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The record does not exist, or is not owned by the requester.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Live states swept to overdue and accepted by start/finish transitions.
const LIVE_STATES: [&str; 2] = ["todo", "started"];

#[derive(Debug, Clone)]
pub struct NewTaskInput {
    pub subject_id: String,
    pub title: String,
    pub description: String,
    pub due_date: NaiveDate,
    pub time_minutes: i32,
}

/// A task joined with its subject name and display point value: the recorded
/// award for done tasks, 0 for overdue ones, projected difficulty * 10
/// otherwise.
#[derive(Debug, Clone)]
pub struct TaskWithPoints {
    pub task: Task,
    pub subject_name: String,
    pub points: i32,
}

#[derive(Debug)]
pub struct TaskPage {
    pub items: Vec<TaskWithPoints>,
    pub page: usize,
    pub total: i64,
}

#[derive(Debug)]
pub struct TaskBuckets {
    pub started: TaskPage,
    pub todo: TaskPage,
    pub done: TaskPage,
    pub overdue: TaskPage,
}

/// 1-based page selection, one per bucket.
#[derive(Debug, Clone, Copy)]
pub struct ListPages {
    pub started: usize,
    pub todo: usize,
    pub done: usize,
    pub overdue: usize,
}

impl Default for ListPages {
    fn default() -> Self {
        Self {
            started: 1,
            todo: 1,
            done: 1,
            overdue: 1,
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    pub async fn connect_sqlite(path: &str) -> Result<Self, StorageError> {
        let url = path.to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder().max_size(8).build(manager)?;

        // Run pending Diesel migrations on startup (auto-init empty DBs)
        {
            let pool_clone = pool.clone();
            tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
                const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
                let mut conn = pool_clone.get()?;
                configure_sqlite_conn(&mut conn)?;
                conn.run_pending_migrations(MIGRATIONS)
                    .map_err(|e| StorageError::Migration(e.to_string()))?;
                Ok(())
            })
            .await??;
        }

        Ok(Store { pool })
    }

    pub async fn seed_from_config(
        &self,
        cfg_parents: &[eduquest_shared::domain::Parent],
        cfg_children: &[eduquest_shared::domain::Child],
        cfg_subjects: &[eduquest_shared::domain::Subject],
    ) -> Result<(), StorageError> {
        use schema::{children, parents, subjects};

        let pool = self.pool.clone();
        let parents_owned = cfg_parents.to_owned();
        let children_owned = cfg_children.to_owned();
        let subjects_owned = cfg_subjects.to_owned();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;

            for p in &parents_owned {
                let new_parent = NewParent {
                    id: &p.id,
                    display_name: &p.display_name,
                };
                diesel::insert_into(parents::table)
                    .values(&new_parent)
                    .on_conflict(parents::id)
                    .do_update()
                    .set(parents::display_name.eq(new_parent.display_name))
                    .execute(&mut conn)?;
            }

            for c in &children_owned {
                let new_child = NewChild {
                    id: &c.id,
                    parent_id: &c.parent_id,
                    display_name: &c.display_name,
                };
                diesel::insert_into(children::table)
                    .values(&new_child)
                    .on_conflict(children::id)
                    .do_update()
                    .set((
                        children::parent_id.eq(new_child.parent_id),
                        children::display_name.eq(new_child.display_name),
                    ))
                    .execute(&mut conn)?;
            }

            for s in &subjects_owned {
                let new_subject = NewSubject {
                    id: &s.id,
                    name: &s.name,
                };
                diesel::insert_into(subjects::table)
                    .values(&new_subject)
                    .on_conflict(subjects::id)
                    .do_update()
                    .set(subjects::name.eq(new_subject.name))
                    .execute(&mut conn)?;
            }

            Ok(())
        })
        .await?
    }

    /// Children of `parent`, each with a flag telling whether any preference
    /// has been recorded for them yet.
    pub async fn list_children_of_parent(
        &self,
        parent: &str,
    ) -> Result<Vec<(Child, bool)>, StorageError> {
        use schema::{children, preferences};
        let pool = self.pool.clone();
        let parent_owned = parent.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<(Child, bool)>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let rows = children::table
                .filter(children::parent_id.eq(&parent_owned))
                .order(children::display_name.asc())
                .load::<Child>(&mut conn)?;
            let rated: std::collections::HashSet<String> = preferences::table
                .select(preferences::child_id)
                .distinct()
                .load::<String>(&mut conn)?
                .into_iter()
                .collect();
            Ok(rows
                .into_iter()
                .map(|c| {
                    let has = rated.contains(&c.id);
                    (c, has)
                })
                .collect())
        })
        .await?
    }

    /// Looks up a child scoped by its parent. A child that exists but belongs
    /// to a different parent reads as not found, so record existence is never
    /// leaked across families.
    pub async fn get_child_of_parent(
        &self,
        parent: &str,
        child: &str,
    ) -> Result<Child, StorageError> {
        use schema::children;
        let pool = self.pool.clone();
        let parent_owned = parent.to_string();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<Child, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            children::table
                .filter(children::id.eq(&child_owned))
                .filter(children::parent_id.eq(&parent_owned))
                .first::<Child>(&mut conn)
                .optional()?
                .ok_or_else(|| StorageError::NotFound(format!("child not found: {child_owned}")))
        })
        .await?
    }

    pub async fn child_exists(&self, child: &str) -> Result<bool, StorageError> {
        use schema::children::dsl::*;
        let pool = self.pool.clone();
        let child_id = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let count: i64 = children
                .filter(id.eq(&child_id))
                .count()
                .get_result(&mut conn)?;
            Ok(count > 0)
        })
        .await?
    }

    /// Wholesale replacement of a child's preferences, the only write path
    /// the preference form has: delete everything, then insert the non-zero
    /// ratings. Runs in one transaction.
    pub async fn replace_preferences(
        &self,
        child: &str,
        prefs: &[(String, i32)],
    ) -> Result<(), StorageError> {
        use schema::preferences;
        for (subject, difficulty) in prefs {
            if Difficulty::new(*difficulty).is_none() {
                return Err(StorageError::InvalidInput(format!(
                    "difficulty for subject {subject} must be within 0..=5, got {difficulty}"
                )));
            }
        }
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        let prefs_owned = prefs.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            ensure_child_exists(&mut conn, &child_owned)?;
            conn.immediate_transaction(|conn| -> Result<(), StorageError> {
                diesel::delete(
                    preferences::table.filter(preferences::child_id.eq(&child_owned)),
                )
                .execute(conn)?;
                for (subject, difficulty) in &prefs_owned {
                    if *difficulty == 0 {
                        continue;
                    }
                    let row = NewPreference {
                        child_id: &child_owned,
                        subject_id: subject,
                        difficulty: *difficulty,
                    };
                    diesel::insert_into(preferences::table)
                        .values(&row)
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await?
    }

    pub async fn list_preferences(
        &self,
        child: &str,
    ) -> Result<Vec<(Preference, String)>, StorageError> {
        use schema::{preferences, subjects};
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(
            move || -> Result<Vec<(Preference, String)>, StorageError> {
                let mut conn = pool.get()?;
                configure_sqlite_conn(&mut conn)?;
                Ok(preferences::table
                    .inner_join(subjects::table)
                    .filter(preferences::child_id.eq(&child_owned))
                    .order(subjects::name.asc())
                    .select((Preference::as_select(), subjects::name))
                    .load::<(Preference, String)>(&mut conn)?)
            },
        )
        .await?
    }

    /// Difficulty the parent assigned for (child, subject); 0 when no
    /// preference exists. Missing preferences are a valid zero-scoring case,
    /// never an error.
    pub async fn get_difficulty(&self, child: &str, subject: &str) -> Result<i32, StorageError> {
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        let subject_owned = subject.to_string();
        tokio::task::spawn_blocking(move || -> Result<i32, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            difficulty_for(&mut conn, &child_owned, &subject_owned)
        })
        .await?
    }

    pub async fn create_task(
        &self,
        child: &str,
        input: NewTaskInput,
        today: NaiveDate,
        now: NaiveDateTime,
    ) -> Result<Task, StorageError> {
        use schema::{subjects, tasks};
        if input.due_date < today {
            return Err(StorageError::InvalidInput(format!(
                "due date {} is in the past",
                input.due_date
            )));
        }
        if input.time_minutes < 0 {
            return Err(StorageError::InvalidInput(
                "allotted minutes must be non-negative".to_string(),
            ));
        }
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<Task, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            ensure_child_exists(&mut conn, &child_owned)?;
            let subject_known: i64 = subjects::table
                .filter(subjects::id.eq(&input.subject_id))
                .count()
                .get_result(&mut conn)?;
            if subject_known == 0 {
                return Err(StorageError::InvalidInput(format!(
                    "unknown subject: {}",
                    input.subject_id
                )));
            }
            let row = NewTask {
                child_id: &child_owned,
                subject_id: &input.subject_id,
                title: &input.title,
                description: &input.description,
                due_date: input.due_date,
                time_minutes: input.time_minutes,
                status: TaskStatus::ToDo.as_str(),
                created_at: now,
            };
            Ok(diesel::insert_into(tasks::table)
                .values(&row)
                .returning(Task::as_returning())
                .get_result(&mut conn)?)
        })
        .await?
    }

    /// Single task with its display point value. Sweeps the row first so a
    /// stale due date is reflected before points are computed.
    pub async fn get_task_with_points(
        &self,
        child: &str,
        task_id: i32,
        today: NaiveDate,
    ) -> Result<TaskWithPoints, StorageError> {
        use schema::{subjects, tasks};
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<TaskWithPoints, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<TaskWithPoints, StorageError> {
                sweep_overdue(conn, &child_owned, today)?;
                let (task, subject_name) = tasks::table
                    .inner_join(subjects::table)
                    .filter(tasks::id.eq(task_id))
                    .filter(tasks::child_id.eq(&child_owned))
                    .select((Task::as_select(), subjects::name))
                    .first::<(Task, String)>(conn)
                    .optional()?
                    .ok_or_else(|| {
                        StorageError::NotFound(format!("task not found: {task_id}"))
                    })?;
                let points = display_points(conn, &task)?;
                Ok(TaskWithPoints {
                    task,
                    subject_name,
                    points,
                })
            })
        })
        .await?
    }

    /// Start (or re-start) a task. Valid from todo and started; re-starting
    /// just re-stamps started_at. Returns the remaining minutes the client
    /// timer should count down from.
    pub async fn start_task(
        &self,
        child: &str,
        task_id: i32,
        now: NaiveDateTime,
    ) -> Result<i32, StorageError> {
        use schema::tasks;
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<i32, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<i32, StorageError> {
                let task = load_owned_task(conn, &child_owned, task_id)?;
                match task.status() {
                    TaskStatus::ToDo | TaskStatus::Started => {}
                    other => {
                        return Err(StorageError::InvalidInput(format!(
                            "cannot start a {other} task"
                        )));
                    }
                }
                diesel::update(tasks::table.filter(tasks::id.eq(task_id)))
                    .set((
                        tasks::status.eq(TaskStatus::Started.as_str()),
                        tasks::started_at.eq(Some(now)),
                    ))
                    .execute(conn)?;
                Ok(task.time_minutes)
            })
        })
        .await?
    }

    /// Persist the remaining minutes reported by a paused timer. Only valid
    /// while the task is started; zero is accepted and does not finish the
    /// task — finishing is always an explicit transition.
    pub async fn pause_task(
        &self,
        child: &str,
        task_id: i32,
        remaining_minutes: i32,
    ) -> Result<(), StorageError> {
        use schema::tasks;
        if remaining_minutes < 0 {
            return Err(StorageError::InvalidInput(format!(
                "remaining minutes must be non-negative, got {remaining_minutes}"
            )));
        }
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<(), StorageError> {
                let task = load_owned_task(conn, &child_owned, task_id)?;
                if task.status() != TaskStatus::Started {
                    return Err(StorageError::InvalidInput(format!(
                        "cannot pause a {} task",
                        task.status()
                    )));
                }
                diesel::update(tasks::table.filter(tasks::id.eq(task_id)))
                    .set(tasks::time_minutes.eq(remaining_minutes))
                    .execute(conn)?;
                Ok(())
            })
        })
        .await?
    }

    /// Finish a task and award points, atomically: the status update is a
    /// compare-and-swap over the live states and the points entry insert is
    /// guarded by the UNIQUE(task_id) index, so a double-submit can neither
    /// finish twice nor award twice.
    pub async fn finish_task(
        &self,
        child: &str,
        task_id: i32,
        now: NaiveDateTime,
    ) -> Result<i32, StorageError> {
        use schema::{points_entries, tasks};
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<i32, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<i32, StorageError> {
                let task = load_owned_task(conn, &child_owned, task_id)?;
                match task.status() {
                    TaskStatus::ToDo | TaskStatus::Started => {}
                    other => {
                        return Err(StorageError::InvalidInput(format!(
                            "cannot finish a {other} task"
                        )));
                    }
                }
                let difficulty = difficulty_for(conn, &child_owned, &task.subject_id)?;
                let awarded = points::award(
                    Difficulty(difficulty),
                    task.started_at,
                    now,
                    task.due_date,
                );
                let updated = diesel::update(
                    tasks::table
                        .filter(tasks::id.eq(task_id))
                        .filter(tasks::status.eq_any(LIVE_STATES)),
                )
                .set((
                    tasks::status.eq(TaskStatus::Done.as_str()),
                    tasks::finished_at.eq(Some(now)),
                ))
                .execute(conn)?;
                if updated == 0 {
                    return Err(StorageError::InvalidInput(
                        "task state changed concurrently".to_string(),
                    ));
                }
                let entry = NewPointsEntry {
                    child_id: &child_owned,
                    task_id,
                    subject_id: &task.subject_id,
                    points: awarded,
                    awarded_at: now,
                };
                diesel::insert_into(points_entries::table)
                    .values(&entry)
                    .execute(conn)?;
                Ok(awarded)
            })
        })
        .await?
    }

    pub async fn delete_task(&self, child: &str, task_id: i32) -> Result<(), StorageError> {
        use schema::{points_entries, tasks};
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<(), StorageError> {
                diesel::delete(
                    points_entries::table
                        .filter(points_entries::task_id.eq(task_id))
                        .filter(points_entries::child_id.eq(&child_owned)),
                )
                .execute(conn)?;
                let deleted = diesel::delete(
                    tasks::table
                        .filter(tasks::id.eq(task_id))
                        .filter(tasks::child_id.eq(&child_owned)),
                )
                .execute(conn)?;
                if deleted == 0 {
                    return Err(StorageError::NotFound(format!("task not found: {task_id}")));
                }
                Ok(())
            })
        })
        .await?
    }

    /// The task listing read: sweep stale live tasks to overdue, then
    /// partition into the four status buckets, each independently paginated.
    pub async fn sweep_and_list_tasks(
        &self,
        child: &str,
        today: NaiveDate,
        pages: ListPages,
        per_page: usize,
    ) -> Result<TaskBuckets, StorageError> {
        use schema::{subjects, tasks};
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        let per_page = per_page.clamp(1, 1000) as i64;
        tokio::task::spawn_blocking(move || -> Result<TaskBuckets, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<TaskBuckets, StorageError> {
                sweep_overdue(conn, &child_owned, today)?;

                let mut bucket = |status: TaskStatus,
                                  page: usize|
                 -> Result<TaskPage, StorageError> {
                    let page = page.max(1);
                    let offset = ((page as i64) - 1) * per_page;
                    let total: i64 = tasks::table
                        .filter(tasks::child_id.eq(&child_owned))
                        .filter(tasks::status.eq(status.as_str()))
                        .count()
                        .get_result(conn)?;
                    // Done is most-recent-first; everything else is by urgency.
                    let rows: Vec<(Task, String)> = match status {
                        TaskStatus::Done => tasks::table
                            .inner_join(subjects::table)
                            .filter(tasks::child_id.eq(&child_owned))
                            .filter(tasks::status.eq(status.as_str()))
                            .select((Task::as_select(), subjects::name))
                            .order(tasks::finished_at.desc())
                            .offset(offset)
                            .limit(per_page)
                            .load(conn)?,
                        _ => tasks::table
                            .inner_join(subjects::table)
                            .filter(tasks::child_id.eq(&child_owned))
                            .filter(tasks::status.eq(status.as_str()))
                            .select((Task::as_select(), subjects::name))
                            .order(tasks::due_date.asc())
                            .offset(offset)
                            .limit(per_page)
                            .load(conn)?,
                    };
                    let items = rows
                        .into_iter()
                        .map(|(task, subject_name)| {
                            let points = display_points(conn, &task)?;
                            Ok(TaskWithPoints {
                                task,
                                subject_name,
                                points,
                            })
                        })
                        .collect::<Result<Vec<_>, StorageError>>()?;
                    Ok(TaskPage { items, page, total })
                };

                Ok(TaskBuckets {
                    started: bucket(TaskStatus::Started, pages.started)?,
                    todo: bucket(TaskStatus::ToDo, pages.todo)?,
                    done: bucket(TaskStatus::Done, pages.done)?,
                    overdue: bucket(TaskStatus::Overdue, pages.overdue)?,
                })
            })
        })
        .await?
    }

    /// All of a child's tasks, due-date ascending, for the parent-facing
    /// overview. Sweeps first like any other listing read.
    pub async fn list_tasks_for_overview(
        &self,
        child: &str,
        today: NaiveDate,
    ) -> Result<Vec<TaskWithPoints>, StorageError> {
        use schema::{subjects, tasks};
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<TaskWithPoints>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<Vec<TaskWithPoints>, StorageError> {
                sweep_overdue(conn, &child_owned, today)?;
                let rows: Vec<(Task, String)> = tasks::table
                    .inner_join(subjects::table)
                    .filter(tasks::child_id.eq(&child_owned))
                    .order(tasks::due_date.asc())
                    .select((Task::as_select(), subjects::name))
                    .load(conn)?;
                rows.into_iter()
                    .map(|(task, subject_name)| {
                        let points = display_points(conn, &task)?;
                        Ok(TaskWithPoints {
                            task,
                            subject_name,
                            points,
                        })
                    })
                    .collect()
            })
        })
        .await?
    }

    /// Create a reward, deactivating the child's current active one in the
    /// same transaction so the partial unique index never sees two active
    /// rows for one child.
    pub async fn create_reward(
        &self,
        child: &str,
        name: &str,
        points_required: i32,
        now: NaiveDateTime,
    ) -> Result<Reward, StorageError> {
        use schema::rewards;
        validate_reward_input(name, points_required)?;
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        let name_owned = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<Reward, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            ensure_child_exists(&mut conn, &child_owned)?;
            conn.immediate_transaction(|conn| -> Result<Reward, StorageError> {
                diesel::update(
                    rewards::table
                        .filter(rewards::child_id.eq(&child_owned))
                        .filter(rewards::is_active.eq(true)),
                )
                .set(rewards::is_active.eq(false))
                .execute(conn)?;
                let row = NewReward {
                    child_id: &child_owned,
                    name: &name_owned,
                    points_required,
                    is_active: true,
                    created_at: now,
                };
                Ok(diesel::insert_into(rewards::table)
                    .values(&row)
                    .returning(Reward::as_returning())
                    .get_result(conn)?)
            })
        })
        .await?
    }

    pub async fn update_reward(
        &self,
        child: &str,
        reward_id: i32,
        name: &str,
        points_required: i32,
    ) -> Result<(), StorageError> {
        use schema::rewards;
        validate_reward_input(name, points_required)?;
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        let name_owned = name.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let updated = diesel::update(
                rewards::table
                    .filter(rewards::id.eq(reward_id))
                    .filter(rewards::child_id.eq(&child_owned)),
            )
            .set((
                rewards::name.eq(&name_owned),
                rewards::points_required.eq(points_required),
            ))
            .execute(&mut conn)?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!(
                    "reward not found: {reward_id}"
                )));
            }
            Ok(())
        })
        .await?
    }

    pub async fn delete_reward(&self, child: &str, reward_id: i32) -> Result<(), StorageError> {
        use schema::rewards;
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let deleted = diesel::delete(
                rewards::table
                    .filter(rewards::id.eq(reward_id))
                    .filter(rewards::child_id.eq(&child_owned)),
            )
            .execute(&mut conn)?;
            if deleted == 0 {
                return Err(StorageError::NotFound(format!(
                    "reward not found: {reward_id}"
                )));
            }
            Ok(())
        })
        .await?
    }

    /// The child's active reward plus the points earned since it was
    /// created. `None` when no reward is active; progress is then (0, false)
    /// at the caller.
    pub async fn active_reward_progress(
        &self,
        child: &str,
    ) -> Result<Option<(Reward, i64)>, StorageError> {
        use diesel::dsl::sum;
        use schema::{points_entries, rewards};
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(
            move || -> Result<Option<(Reward, i64)>, StorageError> {
                let mut conn = pool.get()?;
                configure_sqlite_conn(&mut conn)?;
                let reward = rewards::table
                    .filter(rewards::child_id.eq(&child_owned))
                    .filter(rewards::is_active.eq(true))
                    .first::<Reward>(&mut conn)
                    .optional()?;
                let Some(reward) = reward else {
                    return Ok(None);
                };
                let earned: Option<i64> = points_entries::table
                    .filter(points_entries::child_id.eq(&child_owned))
                    .filter(points_entries::awarded_at.ge(reward.created_at))
                    .select(sum(points_entries::points))
                    .first::<Option<i64>>(&mut conn)?;
                Ok(Some((reward, earned.unwrap_or(0))))
            },
        )
        .await?
    }

    /// Mark a reward claimed. Valid only while the reward is active and owned
    /// by the child; achievement is deliberately not checked here.
    pub async fn claim_reward(&self, child: &str, reward_id: i32) -> Result<(), StorageError> {
        use schema::rewards;
        let pool = self.pool.clone();
        let child_owned = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let updated = diesel::update(
                rewards::table
                    .filter(rewards::id.eq(reward_id))
                    .filter(rewards::child_id.eq(&child_owned))
                    .filter(rewards::is_active.eq(true)),
            )
            .set(rewards::is_active.eq(false))
            .execute(&mut conn)?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!(
                    "active reward not found: {reward_id}"
                )));
            }
            Ok(())
        })
        .await?
    }

    /// Remove a parent and every dependent record of every child: points
    /// entries, rewards, preferences, tasks, then the children and the parent
    /// row itself. One transaction; points and rewards have no foreign key to
    /// the parent, so each table is deleted explicitly.
    pub async fn delete_parent_cascade(&self, parent: &str) -> Result<(), StorageError> {
        use schema::{children, parents, points_entries, preferences, rewards, tasks};
        let pool = self.pool.clone();
        let parent_owned = parent.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<(), StorageError> {
                let child_ids: Vec<String> = children::table
                    .filter(children::parent_id.eq(&parent_owned))
                    .select(children::id)
                    .load(conn)?;
                diesel::delete(
                    points_entries::table
                        .filter(points_entries::child_id.eq_any(&child_ids)),
                )
                .execute(conn)?;
                diesel::delete(rewards::table.filter(rewards::child_id.eq_any(&child_ids)))
                    .execute(conn)?;
                diesel::delete(
                    preferences::table.filter(preferences::child_id.eq_any(&child_ids)),
                )
                .execute(conn)?;
                diesel::delete(tasks::table.filter(tasks::child_id.eq_any(&child_ids)))
                    .execute(conn)?;
                diesel::delete(children::table.filter(children::parent_id.eq(&parent_owned)))
                    .execute(conn)?;
                let deleted =
                    diesel::delete(parents::table.filter(parents::id.eq(&parent_owned)))
                        .execute(conn)?;
                if deleted == 0 {
                    return Err(StorageError::NotFound(format!(
                        "parent not found: {parent_owned}"
                    )));
                }
                Ok(())
            })
        })
        .await?
    }
}

/// Reclassify stale live tasks as overdue. Lazy and idempotent; runs inside
/// the caller's transaction before any status-dependent read. Done tasks are
/// never touched, so a task finished on time can never become overdue.
fn sweep_overdue(
    conn: &mut SqliteConnection,
    child: &str,
    today: NaiveDate,
) -> Result<usize, StorageError> {
    use schema::tasks;
    Ok(diesel::update(
        tasks::table
            .filter(tasks::child_id.eq(child))
            .filter(tasks::status.eq_any(LIVE_STATES))
            .filter(tasks::due_date.lt(today)),
    )
    .set(tasks::status.eq(TaskStatus::Overdue.as_str()))
    .execute(conn)?)
}

fn load_owned_task(
    conn: &mut SqliteConnection,
    child: &str,
    task_id: i32,
) -> Result<Task, StorageError> {
    use schema::tasks;
    tasks::table
        .filter(tasks::id.eq(task_id))
        .filter(tasks::child_id.eq(child))
        .first::<Task>(conn)
        .optional()?
        .ok_or_else(|| StorageError::NotFound(format!("task not found: {task_id}")))
}

fn difficulty_for(
    conn: &mut SqliteConnection,
    child: &str,
    subject: &str,
) -> Result<i32, StorageError> {
    use schema::preferences;
    Ok(preferences::table
        .filter(preferences::child_id.eq(child))
        .filter(preferences::subject_id.eq(subject))
        .select(preferences::difficulty)
        .first::<i32>(conn)
        .optional()?
        .unwrap_or(0))
}

fn display_points(conn: &mut SqliteConnection, task: &Task) -> Result<i32, StorageError> {
    use schema::points_entries;
    match task.status() {
        TaskStatus::Done => Ok(points_entries::table
            .filter(points_entries::task_id.eq(task.id))
            .select(points_entries::points)
            .first::<i32>(conn)
            .optional()?
            .unwrap_or(0)),
        TaskStatus::Overdue => Ok(0),
        TaskStatus::ToDo | TaskStatus::Started => {
            let difficulty = difficulty_for(conn, &task.child_id, &task.subject_id)?;
            Ok(points::base_points(Difficulty(difficulty)))
        }
    }
}

fn ensure_child_exists(conn: &mut SqliteConnection, child: &str) -> Result<(), StorageError> {
    use schema::children;
    let count: i64 = children::table
        .filter(children::id.eq(child))
        .count()
        .get_result(conn)?;
    if count == 0 {
        return Err(StorageError::NotFound(format!("child not found: {child}")));
    }
    Ok(())
}

fn validate_reward_input(name: &str, points_required: i32) -> Result<(), StorageError> {
    if name.trim().is_empty() {
        return Err(StorageError::InvalidInput(
            "reward name must not be empty".to_string(),
        ));
    }
    if points_required < 10 {
        return Err(StorageError::InvalidInput(format!(
            "points required must be at least 10, got {points_required}"
        )));
    }
    Ok(())
}

fn configure_sqlite_conn(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Enable WAL for better read/write concurrency and set a busy timeout
    // Ignore the result rows; Diesel's execute is fine for PRAGMAs
    diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous=NORMAL;").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout=5000;").execute(conn)?;
    diesel::sql_query("PRAGMA foreign_keys=ON;").execute(conn)?;
    Ok(())
}
