use std::path::{Path, PathBuf};

use dbvault_daemon::config::{Config, Settings};
use dbvault_daemon::{build_router, open_service, AppState};
use rusqlite::Connection;
use serde_json::{json, Value};

fn sample_shop(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, code TEXT UNIQUE NOT NULL, name TEXT);
         CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT);
         INSERT INTO customers (code, name) VALUES ('C1', 'Ada'), ('C2', 'Grace'), ('C3', 'Edsger');
         INSERT INTO settings VALUES ('currency', 'EUR');",
    )
    .unwrap();
}

fn config_for(db: &Path) -> Config {
    let raw = format!(
        r#"
[[targets]]
id = "shop"
engine = "sqlite"
path = "{}"

[[targets.tables]]
name = "customers"
kind = "customers"
natural_key = ["code"]

[[targets.tables]]
name = "settings"
kind = "settings"
id_column = "key"
"#,
        db.display()
    );
    toml::from_str(&raw).unwrap()
}

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    db: PathBuf,
    _tmp: tempfile::TempDir,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{path}", self.base_url)
    }

    fn customers(&self) -> i64 {
        Connection::open(&self.db)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM customers", [], |r| r.get(0))
            .unwrap()
    }
}

async fn start_server(api_token: Option<String>) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("shop.db");
    sample_shop(&db);
    let cfg = config_for(&db);
    let root = tmp.path().join("data");
    let settings = Settings::resolve(&cfg, |key| {
        (key == "DBVAULT_ROOT").then(|| root.display().to_string())
    });
    let service = open_service(&cfg, &settings).await.unwrap();

    let state = AppState { service, api_token };
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        db,
        _tmp: tmp,
        _handle: handle,
    }
}

async fn create_backup(srv: &TestServer, kind: &str) -> Value {
    let resp = srv
        .client
        .post(srv.url("/backups"))
        .json(&json!({ "target_id": "shop", "kind": kind, "created_by": "tests" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn test_healthz() {
    let srv = start_server(None).await;
    let resp = srv.client.get(srv.url("/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_list_and_detail() {
    let srv = start_server(None).await;
    let created = create_backup(&srv, "customers").await;
    assert_eq!(created["status"], "success");
    assert_eq!(created["format"], "json-fixture-gzip");
    assert_eq!(created["created_by"], "tests");
    let id = created["id"].as_str().unwrap().to_owned();

    let resp = srv
        .client
        .get(srv.url("/backups?target=shop"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let list: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], id);

    let list: Vec<Value> = srv
        .client
        .get(srv.url("/backups?target=elsewhere"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list.is_empty());

    let resp = srv.client.get(srv.url(&format!("/backups/{id}"))).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "customers");
    assert_eq!(body["checksum"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn test_download_returns_artifact_bytes() {
    let srv = start_server(None).await;
    let created = create_backup(&srv, "full").await;
    let id = created["id"].as_str().unwrap();

    let resp = srv
        .client
        .get(srv.url(&format!("/backups/{id}/download")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let ct = resp.headers()["content-type"].to_str().unwrap().to_owned();
    assert_eq!(ct, "application/octet-stream");
    let cd = resp.headers()["content-disposition"].to_str().unwrap().to_owned();
    assert!(cd.contains(".json.gz"));
    let bytes = resp.bytes().await.unwrap();
    assert_eq!(bytes.len() as i64, created["size_bytes"].as_i64().unwrap());
    assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
}

#[tokio::test]
async fn test_restore_backup_with_clear() {
    let srv = start_server(None).await;
    let created = create_backup(&srv, "customers").await;
    let id = created["id"].as_str().unwrap();
    Connection::open(&srv.db)
        .unwrap()
        .execute_batch("DELETE FROM customers WHERE code <> 'C1'")
        .unwrap();

    let resp = srv
        .client
        .post(srv.url(&format!("/backups/{id}/restore")))
        .json(&json!({ "clear_data_before_restore": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let result: Value = resp.json().await.unwrap();
    assert_eq!(result["strategy"], "fixture-rows");
    assert_eq!(result["success_count"], 3);
    assert_eq!(result["error_count"], 0);
    assert_eq!(srv.customers(), 3);

    let history: Vec<Value> = srv
        .client
        .get(srv.url("/targets/shop/restores"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["backup_id"], id);
}

#[tokio::test]
async fn test_restore_upload_reports_row_errors() {
    let srv = start_server(None).await;
    let upload = concat!(
        "[\n",
        "{\"table\":\"customers\",\"natural_key\":{\"code\":\"C1\"},\"fields\":{\"name\":\"Ada\"}},\n",
        "{\"table\":\"customers\",\"natural_key\":{\"code\":\"C2\"},\"fields\":{\"nickname\":\"Grace\"}},\n",
        "{\"table\":\"customers\",\"natural_key\":{\"code\":\"C3\"},\"fields\":{\"name\":\"Edsger\"}}\n",
        "]\n"
    );
    let resp = srv
        .client
        .post(srv.url("/targets/shop/restore-upload?file_name=customers.json&kind=customers&clear=true"))
        .body(upload)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let result: Value = resp.json().await.unwrap();
    assert_eq!(result["success_count"], 2);
    assert_eq!(result["error_count"], 1);
    assert_eq!(result["errors"][0]["identifier"], "customers[code=C2]");
    assert_eq!(srv.customers(), 2);
}

#[tokio::test]
async fn test_incompatible_upload_is_unprocessable() {
    let srv = start_server(None).await;
    let mut dump = b"PGDMP".to_vec();
    dump.extend_from_slice(&[0u8; 512]);
    let resp = srv
        .client
        .post(srv.url("/targets/shop/restore-upload?file_name=shop.dump"))
        .body(dump)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("shop.dump"));
    assert_eq!(srv.customers(), 3);

    let resp = srv
        .client
        .post(srv.url("/targets/warehouse/restore-upload?file_name=x.json"))
        .body("[]")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_unknown_and_malformed_ids() {
    let srv = start_server(None).await;
    let missing = uuid::Uuid::new_v4();
    let resp = srv
        .client
        .get(srv.url(&format!("/backups/{missing}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains(&missing.to_string()));

    let resp = srv.client.get(srv.url("/backups/nope")).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let resp = srv
        .client
        .post(srv.url(&format!("/backups/{missing}/restore")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_schedule_lifecycle() {
    let srv = start_server(None).await;

    let resp = srv
        .client
        .post(srv.url("/schedules"))
        .json(&json!({ "target_id": "shop", "kind": "settings", "frequency": "weekly", "hour": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);

    let resp = srv
        .client
        .post(srv.url("/schedules"))
        .json(&json!({
            "target_id": "shop",
            "kind": "settings",
            "frequency": "daily",
            "hour": 2,
            "minute": 30,
            "max_backups": 2
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let schedule: Value = resp.json().await.unwrap();
    let id = schedule["id"].as_str().unwrap().to_owned();
    assert!(schedule["next_run"].is_string());

    for _ in 0..3 {
        let resp = srv
            .client
            .post(srv.url(&format!("/schedules/{id}/run")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let record: Value = resp.json().await.unwrap();
        assert_eq!(record["is_scheduled"], true);
        assert_eq!(record["created_by"], "scheduler");
    }
    let backups: Vec<Value> = srv
        .client
        .get(srv.url("/backups"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(backups.len(), 2);

    let resp = srv
        .client
        .post(srv.url(&format!("/schedules/{id}/toggle")))
        .json(&json!({ "is_active": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let toggled: Value = resp.json().await.unwrap();
    assert_eq!(toggled["is_active"], false);
    assert!(toggled["next_run"].is_null());
    assert!(toggled["last_run"].is_string());

    let listed: Vec<Value> = srv
        .client
        .get(srv.url("/schedules"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let resp = srv
        .client
        .delete(srv.url(&format!("/schedules/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let resp = srv
        .client
        .delete(srv.url(&format!("/schedules/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_api_auth_rejected_without_token() {
    let srv = start_server(Some("secret-token".to_string())).await;

    let resp = srv.client.get(srv.url("/backups")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = srv
        .client
        .get(srv.url("/backups"))
        .header("Authorization", "Bearer wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = srv.client.get(srv.url("/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_api_auth_accepted_with_token() {
    let srv = start_server(Some("secret-token".to_string())).await;

    let resp = srv
        .client
        .get(srv.url("/targets"))
        .header("Authorization", "Bearer secret-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let targets: Vec<String> = resp.json().await.unwrap();
    assert_eq!(targets, vec!["shop"]);
}
