//! HTTP gateway for the correction loop.
//!
//! A thin shell: every endpoint validates, delegates to a core module, and
//! shapes the response. The runs and output trees are also served statically
//! so a browser client can fetch artifacts directly.

pub mod error;
mod routes;
pub mod server;

use axum::http::request::Parts;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::config::{origin_allowed, AppConfig};

/// Shared handler state. The config is the only long-lived piece; stores and
/// registries are rebuilt per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
}

/// Build the gateway router over `config`.
pub fn router(config: AppConfig) -> Router {
    let cors = cors_layer(&config.allowed_origins);
    let runs_dir = config.runs_dir.clone();
    let out_dir = config.out_dir.clone();
    let state = AppState {
        config: Arc::new(config),
    };

    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/config", get(routes::config))
        .route("/api/upload_pdf", post(routes::upload_pdf))
        .route("/api/exec_step", post(routes::exec_step))
        .route("/api/log", get(routes::get_log))
        .route("/api/read_text", get(routes::read_text))
        .route("/api/read_csv", get(routes::read_csv))
        .route("/api/save_csv", post(routes::save_csv))
        .route("/api/recalculate", post(routes::recalculate))
        .nest_service("/runs", ServeDir::new(runs_dir))
        .nest_service("/out", ServeDir::new(out_dir))
        .with_state(state)
        .layer(cors)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let patterns = origins.to_vec();
    layer.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _: &Parts| {
            origin
                .to_str()
                .map(|origin| origin_allowed(&patterns, origin))
                .unwrap_or(false)
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::fs;
    use std::path::PathBuf;
    use tower::ServiceExt;

    struct Fixture {
        _tmp: tempfile::TempDir,
        config: AppConfig,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let config = AppConfig {
            runs_dir: root.join("runs"),
            out_dir: root.join("out"),
            repo_root: root,
            allowed_origins: vec!["https://*.github.io".to_string()],
            strict_patch: false,
        };
        Fixture { _tmp: tmp, config }
    }

    fn app(fixture: &Fixture) -> Router {
        router(fixture.config.clone())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn multipart_upload(filename: &str) -> Request<Body> {
        let boundary = "redline-test-boundary";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
             filename=\"{filename}\"\r\nContent-Type: application/pdf\r\n\r\n%PDF-1.4\r\n--{boundary}--\r\n"
        );
        Request::builder()
            .method("POST")
            .uri("/api/upload_pdf")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let f = fixture();
        let response = app(&f).oneshot(get_request("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ok"], true);
    }

    #[tokio::test]
    async fn config_reflects_the_probed_registry() {
        let f = fixture();
        let response = app(&f).oneshot(get_request("/api/config")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["steps"][0]["name"], "echo");
        assert_eq!(
            json["runs_dir"],
            f.config.runs_dir.display().to_string()
        );
    }

    #[tokio::test]
    async fn config_picks_up_pipeline_json_edits_between_requests() {
        let f = fixture();
        let response = app(&f).oneshot(get_request("/api/config")).await.unwrap();
        assert_eq!(body_json(response).await["steps"][0]["name"], "echo");

        fs::write(
            f.config.pipeline_config_path(),
            r#"{"steps":[{"name":"fresh","cmd":"true","outputs":[]}]}"#,
        )
        .unwrap();
        let response = app(&f).oneshot(get_request("/api/config")).await.unwrap();
        assert_eq!(body_json(response).await["steps"][0]["name"], "fresh");
    }

    #[tokio::test]
    async fn upload_rejects_non_pdf_filenames() {
        let f = fixture();
        let response = app(&f).oneshot(multipart_upload("notes.txt")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn upload_stores_the_document_under_a_fresh_run() {
        let f = fixture();
        let response = app(&f)
            .oneshot(multipart_upload("motor_list.PDF"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let run_id = json["run_id"].as_str().unwrap();
        assert!(run_id.starts_with("run-"));
        assert_eq!(json["pdf"], format!("/runs/{run_id}/input.pdf"));
        let stored = f.config.runs_dir.join(run_id).join("input.pdf");
        assert_eq!(fs::read(stored).unwrap(), b"%PDF-1.4");
    }

    #[tokio::test]
    async fn exec_step_rejects_out_of_range_index() {
        let f = fixture();
        let response = app(&f)
            .oneshot(post_json(
                "/api/exec_step",
                serde_json::json!({"run_id": "run-x", "step_index": 9}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn exec_step_requires_an_uploaded_document() {
        let f = fixture();
        let response = app(&f)
            .oneshot(post_json(
                "/api/exec_step",
                serde_json::json!({"run_id": "run-x", "step_index": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        // Refusal happens before anything runs, so no log either.
        assert!(!f.config.runs_dir.join("run-x/echo.log").exists());
    }

    #[tokio::test]
    async fn exec_step_runs_the_diagnostic_step() {
        let f = fixture();
        f.config
            .store()
            .store_input_document("run-x", b"%PDF-1.4")
            .unwrap();

        let response = app(&f)
            .oneshot(post_json(
                "/api/exec_step",
                serde_json::json!({"run_id": "run-x", "step_index": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["exit_code"], 0);
        let marker = f.config.out_dir.join("run-x/pipeline_ok.txt");
        assert_eq!(json["outputs"][marker.display().to_string()], true);
        assert!(json["cmd"].as_str().unwrap().contains("run-x"));
    }

    #[tokio::test]
    async fn log_is_served_after_a_step_and_404s_before() {
        let f = fixture();
        let missing = app(&f)
            .oneshot(get_request("/api/log?run_id=run-x&step_name=echo"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        f.config
            .store()
            .write_step_log("run-x", "echo", "captured output")
            .unwrap();
        let found = app(&f)
            .oneshot(get_request("/api/log?run_id=run-x&step_name=echo"))
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        assert_eq!(body_text(found).await, "captured output");
    }

    #[tokio::test]
    async fn save_then_read_csv_round_trips() {
        let f = fixture();
        let response = app(&f)
            .oneshot(post_json(
                "/api/save_csv",
                serde_json::json!({"path": "edits/fixed.csv", "csv": "a,b\n1,2\n"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let saved = body_json(response).await;
        assert_eq!(saved["ok"], true);
        assert_eq!(
            PathBuf::from(saved["path"].as_str().unwrap()),
            f.config.out_dir.join("edits/fixed.csv")
        );

        let read = app(&f)
            .oneshot(get_request("/api/read_csv?path=edits/fixed.csv"))
            .await
            .unwrap();
        assert_eq!(read.status(), StatusCode::OK);
        assert_eq!(body_text(read).await, "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn read_text_falls_back_to_the_runs_root() {
        let f = fixture();
        f.config
            .store()
            .write_step_log("run-x", "echo", "from runs tree")
            .unwrap();
        let response = app(&f)
            .oneshot(get_request("/api/read_text?path=run-x/echo.log"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "from runs tree");
    }

    #[tokio::test]
    async fn read_text_404s_when_no_root_matches() {
        let f = fixture();
        let response = app(&f)
            .oneshot(get_request("/api/read_text?path=nowhere.txt"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recalculate_applies_a_patch_and_persists_the_audit_set() {
        let f = fixture();
        let body = serde_json::json!({
            "metadata": {"stage": "30_motor_list_normalized.csv", "role": "production"},
            "csv": "row_id,out_kw\n1,10\n",
            "patch": {"ops": [
                {"op": "replace", "row_key": "1", "column": "out_kw", "old": "99", "value": "12"}
            ]}
        });
        let response = app(&f)
            .oneshot(post_json("/api/recalculate", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["summary"]["rows"], 1);
        assert_eq!(json["summary"]["cols"], 2);
        // The stale `old` is observed, not enforced.
        assert_eq!(json["summary"]["applied_ops"], 1);
        assert_eq!(json["summary"]["conflicts"], 1);

        let stage_dir = PathBuf::from(json["saved"]["stage_dir"].as_str().unwrap());
        assert!(stage_dir.ends_with(
            PathBuf::from(json["saved"]["run_id"].as_str().unwrap())
                .join("30_motor_list_normalized")
        ));
        assert_eq!(
            fs::read_to_string(stage_dir.join("received.csv")).unwrap(),
            "row_id,out_kw\n1,10\n"
        );
        assert_eq!(
            fs::read_to_string(stage_dir.join("patched.csv")).unwrap(),
            "row_id,out_kw\n1,12\n"
        );
        assert!(stage_dir.join("metadata.json").exists());
        assert!(stage_dir.join("patch.json").exists());
    }

    #[tokio::test]
    async fn recalculate_without_a_patch_omits_patch_json() {
        let f = fixture();
        let body = serde_json::json!({
            "metadata": {"stage": "s", "role": "calibration", "aggregate": false},
            "csv": "a,b\n1,2\n"
        });
        let response = app(&f)
            .oneshot(post_json("/api/recalculate", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["summary"]["applied_ops"], 0);
        assert!(json["saved"]["patch_path"].is_null());
        let stage_dir = PathBuf::from(json["saved"]["stage_dir"].as_str().unwrap());
        assert!(!stage_dir.join("patch.json").exists());
    }

    #[tokio::test]
    async fn recalculate_validates_stage_and_csv() {
        let f = fixture();
        let empty_stage = serde_json::json!({
            "metadata": {"stage": " ", "role": "production"},
            "csv": "a\n1\n"
        });
        let response = app(&f)
            .oneshot(post_json("/api/recalculate", empty_stage))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let empty_csv = serde_json::json!({
            "metadata": {"stage": "s", "role": "production"},
            "csv": ""
        });
        let response = app(&f)
            .oneshot(post_json("/api/recalculate", empty_csv))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let headerless = serde_json::json!({
            "metadata": {"stage": "s", "role": "production"},
            "csv": "\n"
        });
        let response = app(&f)
            .oneshot(post_json("/api/recalculate", headerless))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cors_allows_listed_wildcard_origins() {
        let f = fixture();
        let request = Request::builder()
            .uri("/api/health")
            .header("Origin", "https://operator.github.io")
            .body(Body::empty())
            .unwrap();
        let response = app(&f).oneshot(request).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .map(|v| v.to_str().unwrap()),
            Some("https://operator.github.io")
        );

        let request = Request::builder()
            .uri("/api/health")
            .header("Origin", "https://evil.example")
            .body(Body::empty())
            .unwrap();
        let response = app(&f).oneshot(request).await.unwrap();
        assert!(response
            .headers()
            .get("access-control-allow-origin")
            .is_none());
    }

    #[tokio::test]
    async fn artifacts_are_served_statically() {
        let f = fixture();
        fs::create_dir_all(f.config.out_dir.join("run-x")).unwrap();
        fs::write(f.config.out_dir.join("run-x/fe_list.csv"), "a\n1\n").unwrap();
        let response = app(&f)
            .oneshot(get_request("/out/run-x/fe_list.csv"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "a\n1\n");
    }
}
