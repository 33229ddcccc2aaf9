use std::time::Duration;

use octofhir_bulk_server::{AppConfig, build_app};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::task::JoinHandle;

struct TestServer {
    base: String,
    client: Client,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
    _exports: TempDir,
}

async fn start_server() -> TestServer {
    let exports = tempfile::tempdir().expect("tempdir");

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let base = format!("http://{addr}");

    let mut cfg = AppConfig::default();
    cfg.server.base_url = Some(base.clone());
    cfg.bulk_export.export_path = exports.path().to_path_buf();
    cfg.bulk_export.batch_size = 2;
    let app = build_app(&cfg).await.expect("build app");
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app.router.clone())
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
        app.shutdown().await;
    });

    TestServer {
        base,
        client: Client::new(),
        shutdown: tx,
        handle,
        _exports: exports,
    }
}

impl TestServer {
    async fn put(&self, resource: Value) {
        let url = format!(
            "{}/{}/{}",
            self.base,
            resource["resourceType"].as_str().unwrap(),
            resource["id"].as_str().unwrap()
        );
        let resp = self.client.put(url).json(&resource).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    async fn kickoff(&self, path_and_query: &str) -> String {
        let resp = self
            .client
            .get(format!("{}{path_and_query}", self.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        resp.headers()["content-location"].to_str().unwrap().to_string()
    }

    /// Polls until the job leaves the 202/429 states.
    async fn wait_for(&self, status_url: &str) -> reqwest::Response {
        for _ in 0..200 {
            let resp = self.client.get(status_url).send().await.unwrap();
            match resp.status() {
                StatusCode::ACCEPTED => {
                    assert_eq!(resp.headers()["x-progress"], "Exporting files");
                    assert_eq!(resp.headers()["retry-after"], "1");
                }
                StatusCode::TOO_MANY_REQUESTS => {}
                _ => return resp,
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("export did not finish");
    }

    async fn manifest(&self, status_url: &str) -> Value {
        let resp = self.wait_for(status_url).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("expires"));
        assert!(
            resp.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("application/json")
        );
        resp.json().await.unwrap()
    }

    async fn ndjson(&self, url: &str) -> Vec<Value> {
        let resp = self.client.get(url).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/fhir+ndjson");
        let body = resp.text().await.unwrap();
        body.split("\r\n")
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

#[tokio::test]
async fn type_scoped_export_returns_the_stored_patient() {
    let server = start_server().await;
    server.put(json!({"resourceType": "Patient", "id": "p1", "gender": "female"})).await;
    server
        .put(json!({
            "resourceType": "Condition",
            "id": "c1",
            "subject": {"reference": "Patient/p1"}
        }))
        .await;

    let status_url = server.kickoff("/$export?_type=Patient").await;
    assert!(status_url.starts_with(&format!("{}/bulkstatus/", server.base)));

    let manifest = server.manifest(&status_url).await;
    assert_eq!(manifest["requiresAccessToken"], json!(false));
    assert_eq!(
        manifest["request"],
        json!(format!("{}/$export?_type=Patient", server.base))
    );
    let output = manifest["output"].as_array().unwrap();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0]["type"], json!("Patient"));
    let file_url = output[0]["url"].as_str().unwrap();
    assert!(file_url.ends_with("/Patient.ndjson"));
    assert!(manifest.get("error").is_none());

    let stored: Value = server
        .client
        .get(format!("{}/Patient/p1", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(server.ndjson(file_url).await, vec![stored]);

    // Terminal polls are stable.
    assert_eq!(server.manifest(&status_url).await, manifest);
    server.stop().await;
}

#[tokio::test]
async fn output_files_are_streamed_chunked() {
    let server = start_server().await;
    for i in 0..40 {
        server
            .put(json!({"resourceType": "Patient", "id": format!("p{i:02}")}))
            .await;
    }

    let status_url = server.kickoff("/$export?_type=Patient").await;
    let manifest = server.manifest(&status_url).await;
    let file_url = manifest["output"][0]["url"].as_str().unwrap();

    let resp = server.client.get(file_url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!resp.headers().contains_key("content-length"));
    assert_eq!(resp.headers()["transfer-encoding"], "chunked");

    let records = server.ndjson(file_url).await;
    assert_eq!(records.len(), 40);
    assert_eq!(records[39]["id"], json!("p39"));
    server.stop().await;
}

#[tokio::test]
async fn elements_keep_only_requested_and_mandatory_fields() {
    let server = start_server().await;
    server
        .put(json!({
            "resourceType": "Condition",
            "id": "c1",
            "subject": {"reference": "Patient/p1"},
            "code": {"text": "asthma"},
            "recordedDate": "2024-01-01"
        }))
        .await;

    let status_url = server.kickoff("/$export?_type=Condition&_elements=id").await;
    let manifest = server.manifest(&status_url).await;
    let file_url = manifest["output"][0]["url"].as_str().unwrap().to_string();

    let records = server.ndjson(&file_url).await;
    assert_eq!(records.len(), 1);
    let record = records[0].as_object().unwrap();
    let mut keys: Vec<&str> = record.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, ["id", "meta", "resourceType", "subject"]);
    assert_eq!(record["meta"]["tag"][0]["code"], json!("SUBSETTED"));
    assert_eq!(record["meta"].as_object().unwrap().len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn group_export_via_parameters_body() {
    let server = start_server().await;
    for id in ["p1", "p2"] {
        server.put(json!({"resourceType": "Patient", "id": id})).await;
        server
            .put(json!({
                "resourceType": "Condition",
                "id": format!("c-{id}"),
                "subject": {"reference": format!("Patient/{id}")}
            }))
            .await;
    }
    server
        .put(json!({
            "resourceType": "Group",
            "id": "g1",
            "type": "person",
            "actual": true,
            "member": [{"entity": {"reference": "Patient/p1"}}]
        }))
        .await;

    let resp = server
        .client
        .post(format!("{}/Group/g1/$export", server.base))
        .json(&json!({
            "resourceType": "Parameters",
            "parameter": [{"name": "_type", "valueString": "Condition"}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let status_url = resp.headers()["content-location"].to_str().unwrap().to_string();

    let manifest = server.manifest(&status_url).await;
    let file_url = manifest["output"][0]["url"].as_str().unwrap().to_string();
    let records = server.ndjson(&file_url).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], json!("c-p1"));
    server.stop().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let server = start_server().await;

    let resp = server
        .client
        .get(format!("{}/$export?_type=Patient,Unicorn", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["resourceType"], json!("OperationOutcome"));
    assert_eq!(
        outcome["issue"][0]["details"]["text"],
        json!("The following resourceType is not supported for _type param for $export: Unicorn")
    );

    let resp = server
        .client
        .post(format!("{}/$export?_type=Patient", server.base))
        .json(&json!({"resourceType": "Parameters"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .client
        .get(format!("{}/Group/missing/$export", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server
        .client
        .get(format!("{}/bulkstatus/unknown", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(
        outcome["issue"][0]["details"]["text"],
        json!("Could not find bulk export request with id: unknown")
    );

    let resp = server
        .client
        .get(format!("{}/bulkfiles/unknown/Patient.ndjson", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server.client.get(format!("{}/healthz", server.base)).send().await.unwrap();
    assert!(resp.status().is_success());
    server.stop().await;
}
