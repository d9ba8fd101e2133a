use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

fn base_join(base: &str, path: &str) -> String {
    let b = base.trim_end_matches('/');
    let p = path.trim_start_matches('/');
    format!("{}/{}", b, p)
}

fn enc(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

pub fn auth_login(base: &str) -> String {
    base_join(base, "/api/auth/login")
}
pub fn children(base: &str) -> String {
    base_join(base, "/api/children")
}
pub fn child_preferences(base: &str, child_id: &str) -> String {
    base_join(base, &format!("/api/children/{}/preferences", enc(child_id)))
}
pub fn child_overview(base: &str, child_id: &str) -> String {
    base_join(base, &format!("/api/children/{}/overview", enc(child_id)))
}
pub fn child_rewards(base: &str, child_id: &str) -> String {
    base_join(base, &format!("/api/children/{}/rewards", enc(child_id)))
}
pub fn child_active_reward(base: &str, child_id: &str) -> String {
    base_join(base, &format!("/api/children/{}/reward", enc(child_id)))
}
pub fn child_reward(base: &str, child_id: &str, reward_id: i32) -> String {
    base_join(
        base,
        &format!("/api/children/{}/rewards/{}", enc(child_id), reward_id),
    )
}
pub fn child_reward_claim(base: &str, child_id: &str, reward_id: i32) -> String {
    base_join(
        base,
        &format!(
            "/api/children/{}/rewards/{}/claim",
            enc(child_id),
            reward_id
        ),
    )
}
pub fn tasks(base: &str) -> String {
    base_join(base, "/api/tasks")
}
pub fn task(base: &str, task_id: i32) -> String {
    base_join(base, &format!("/api/tasks/{}", task_id))
}
pub fn task_start(base: &str, task_id: i32) -> String {
    base_join(base, &format!("/api/tasks/{}/start", task_id))
}
pub fn task_pause(base: &str, task_id: i32) -> String {
    base_join(base, &format!("/api/tasks/{}/pause", task_id))
}
pub fn task_finish(base: &str, task_id: i32) -> String {
    base_join(base, &format!("/api/tasks/{}/finish", task_id))
}
pub fn task_finish_early(base: &str, task_id: i32) -> String {
    base_join(base, &format!("/api/tasks/{}/finish-early", task_id))
}
pub fn parent(base: &str, parent_id: &str) -> String {
    base_join(base, &format!("/api/parents/{}", enc(parent_id)))
}
