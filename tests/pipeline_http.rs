use deploy_pipeline::routes::create_router;
use deploy_pipeline::store::traits::BranchStore;
use deploy_pipeline::{
    http_date, BranchAddress, ContentHashes, DeployPipeline, MemoryRemote, MemoryStore,
    PipelineSettings, Reclaimer, ReclaimerSettings, RemoteStore, TieredFileStore,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::{redirect, Client, StatusCode};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;

const HELLO: &[u8] = b"Hello World";

struct TestServer {
    _dir: tempfile::TempDir,
    remote: Arc<MemoryRemote>,
    store: Arc<MemoryStore>,
    pipeline: Arc<DeployPipeline<MemoryStore>>,
    client: Client,
    base_url: String,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let files =
            TieredFileStore::new(dir.path(), Some(remote.clone() as Arc<dyn RemoteStore>)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(DeployPipeline::new(
            store.clone(),
            files,
            PipelineSettings {
                lock_timeout: Duration::from_secs(2),
                password_secret: "integration-secret".to_string(),
                ..PipelineSettings::default()
            },
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let app = create_router::<MemoryStore>(16 * 1024 * 1024).with_state(pipeline.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .unwrap();

        Self {
            _dir: dir,
            remote,
            store,
            pipeline,
            client,
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    async fn post_json(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("x-user-id", "ci-bot")
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

fn gzipped_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, bytes) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *bytes).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

fn sha(bytes: &[u8]) -> String {
    ContentHashes::compute(bytes).sha256
}

#[tokio::test]
async fn test_hello_world_archive_is_served() {
    let server = TestServer::start().await;

    let response = server
        .client
        .post(server.url("/orgs/1/games/2/branches/main/archive"))
        .header("x-user-id", "ci-bot")
        .body(gzipped_tar(&[("index.html", HELLO)]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let activated: Value = response.json().await.unwrap();
    assert_eq!(activated["branch_slug"], "main");
    assert!(activated["servable_url"]
        .as_str()
        .unwrap()
        .ends_with("/play/1/2/main/"));

    // exactly one blob, stored under its hash
    let hash = sha(HELLO);
    assert!(server
        .remote
        .contains(&format!("content/{}/{}/{}", &hash[0..2], &hash[2..4], hash)));

    let deploy_id = activated["deploy_id"].as_i64().unwrap();
    let deploy: Value = server
        .get(&format!("/deploys/{}", deploy_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(deploy["state"], "ready");
    assert_eq!(deploy["deployed_by"], "ci-bot");
    let deployed_on: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(deploy["deployed_on"].clone()).unwrap();

    let response = server.get("/play/1/2/main/index.html").await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert!(headers["cache-control"]
        .to_str()
        .unwrap()
        .contains("must-revalidate"));
    assert_eq!(headers["content-type"], "text/html");
    let last_modified = headers["last-modified"].to_str().unwrap().to_string();
    assert_eq!(last_modified, http_date(&deployed_on));
    assert_eq!(response.bytes().await.unwrap().as_ref(), HELLO);

    // directory index and conditional requests
    let response = server.get("/play/1/2/main/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), HELLO);

    let response = server
        .client
        .get(server.url("/play/1/2/main/index.html"))
        .header("if-modified-since", last_modified)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    assert_eq!(
        server.get("/play/1/2/main/missing.js").await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_incremental_deploy_uploads_only_missing_assets() {
    let server = TestServer::start().await;
    let manifest = json!({
        "manifest": [
            {"path": "index.html", "hash": sha(HELLO)},
            {"path": "js/app.js", "hash": sha(b"run()")},
        ]
    });

    let response = server
        .post_json("/orgs/1/games/2/branches/beta/deploys", manifest.clone())
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let started: Value = response.json().await.unwrap();
    assert_eq!(started["number"], 1);
    assert_eq!(started["missing_assets"].as_array().unwrap().len(), 2);
    let deploy_id = started["deploy_id"].as_i64().unwrap();

    // activation before the uploads is rejected
    let response = server
        .post_json(&format!("/deploys/{}/activate", deploy_id), json!({}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // bytes that do not match the manifest are refused
    let response = server
        .client
        .put(server.url(&format!("/deploys/{}/assets/index.html", deploy_id)))
        .body("Goodbye")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    for (path, bytes) in [("index.html", HELLO), ("js/app.js", b"run()".as_slice())] {
        let response = server
            .client
            .put(server.url(&format!("/deploys/{}/assets/{}", deploy_id, path)))
            .header("content-type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = server
        .post_json(
            &format!("/deploys/{}/activate", deploy_id),
            json!({"concurrency": 2}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = server.get("/play/1/2/beta/js/app.js").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"run()");

    // the same tree again needs no uploads and gets the next number
    let started: Value = server
        .post_json("/orgs/1/games/2/branches/beta/deploys", manifest)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(started["number"], 2);
    assert!(started["missing_assets"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_deploys_need_a_user() {
    let server = TestServer::start().await;
    let response = server
        .client
        .post(server.url("/orgs/1/games/2/branches/main/archive"))
        .body(gzipped_tar(&[("index.html", HELLO)]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_password_protected_branch_flow() {
    let server = TestServer::start().await;
    let response = server
        .client
        .post(server.url("/orgs/1/games/2/branches/main/archive"))
        .header("x-user-id", "ci-bot")
        .body(gzipped_tar(&[("index.html", HELLO)]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let branch = server
        .store
        .find_branch(&BranchAddress::new(1, 2, "main"))
        .await
        .unwrap()
        .unwrap();
    let response = server
        .client
        .put(server.url(&format!("/branches/{}/password", branch.id)))
        .header("x-user-id", "admin")
        .json(&json!({"password": "letmein"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["password_protected"], true);
    assert!(body.get("password_seal").is_none());

    let response = server.get("/play/1/2/main/index.html").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers()["location"],
        "/play/1/2/main/_password?next=index.html"
    );

    let form = server.get("/play/1/2/main/_password?next=index.html").await;
    assert_eq!(form.status(), StatusCode::OK);
    assert!(form.text().await.unwrap().contains("value=\"index.html\""));

    let response = server
        .client
        .post(server.url("/play/1/2/main/_password"))
        .form(&[("password", "wrong"), ("next", "index.html")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = server
        .client
        .post(server.url("/play/1/2/main/_password"))
        .form(&[("password", "letmein"), ("next", "index.html")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()["location"], "/play/1/2/main/index.html");
    let set_cookie = response.headers()["set-cookie"].to_str().unwrap().to_string();
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Lax"));
    let cookie = set_cookie.split(';').next().unwrap().to_string();

    let response = server
        .client
        .get(server.url("/play/1/2/main/index.html"))
        .header("cookie", cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), HELLO);
}

#[tokio::test]
async fn test_superseded_deploy_is_reclaimed() {
    let server = TestServer::start().await;
    let mut deploy_ids = Vec::new();
    for body in [b"v1".as_slice(), b"v2".as_slice()] {
        let activated: Value = server
            .client
            .post(server.url("/orgs/1/games/2/branches/main/archive"))
            .header("x-user-id", "ci-bot")
            .body(gzipped_tar(&[("index.html", body)]))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        deploy_ids.push(activated["deploy_id"].as_i64().unwrap());
    }

    let old: Value = server
        .get(&format!("/deploys/{}", deploy_ids[0]))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(old["deleted_reason"], "superseded");
    let old_path = old["path"].as_str().unwrap().to_string();

    let reclaimer = Reclaimer::new(
        server.store.clone(),
        server.pipeline.files().clone(),
        ReclaimerSettings::default(),
    );
    let report = reclaimer.run_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert!(!server.pipeline.files().exists(&old_path).await.unwrap());

    // the active deploy is untouched
    let response = server.get("/play/1/2/main/index.html").await;
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"v2");
}
