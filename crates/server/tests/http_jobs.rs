#![cfg(unix)]

use std::{fs, path::Path, path::PathBuf};

use axum::{
    body::Body,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE, HOST},
        HeaderName, Request, StatusCode,
    },
    Router,
};
use lookbook_server::{build_router, ServerConfig};
use lookbook_worker::Interpreter;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct Project {
    _temp: TempDir,
    root: PathBuf,
    router: Router,
}

impl Project {
    /// A project root whose worker scripts are shell scripts run by `sh`.
    fn new(scripts: &[(&str, &str)]) -> Self {
        Self::with_config(scripts, |_| {})
    }

    fn with_config(scripts: &[(&str, &str)], configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        for dir in ["scripts", "output", "renders", "public", "secrets"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        fs::write(root.join("secrets/key.txt"), "secret").unwrap();
        for (name, body) in scripts {
            fs::write(root.join("scripts").join(name), body).unwrap();
        }

        let mut config = ServerConfig::for_root(root.clone());
        config.worker.interpreter = Interpreter::Explicit(PathBuf::from("sh"));
        configure(&mut config);
        let router = build_router(&config).unwrap();

        Self {
            _temp: temp,
            root,
            router,
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    async fn post(&self, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(HOST, "localhost:8000")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get(&self, uri: &str) -> (StatusCode, Option<String>, Option<String>, Vec<u8>) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let cache_control = header(CACHE_CONTROL);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, cache_control, bytes.to_vec())
    }
}

fn design_body(id: &str) -> String {
    json!({"design": {"design_id": id, "design_text": "navy wool coat"}}).to_string()
}

fn without_cache_buster(url: &str) -> &str {
    url.split("&t=").next().unwrap()
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn flatlay_saved_line_yields_fetchable_reference() {
    let project = Project::new(&[(
        "render_utils.py",
        "printf '%s\\n' \"$@\" > output/flatlay_args.txt\n\
         printf 'png-bytes' > output/d1_flatlay.png\n\
         echo 'loading model'\n\
         echo 'Saved flatlay render: output/d1_flatlay.png'\n",
    )]);

    let (status, body) = project.post("/api/generate-flatlay", &design_body("d1")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Flatlay render generated successfully");

    let url = body["imageUrl"].as_str().unwrap();
    assert!(url.contains("&t="), "{url}");
    assert_eq!(
        without_cache_buster(url),
        "/api/assets?path=output%2Fd1_flatlay.png"
    );

    let args = read(&project.path("output/flatlay_args.txt"));
    let args: Vec<&str> = args.lines().collect();
    assert_eq!(args[0], "scripts/render_utils.py");
    assert_eq!(args[1], "--input");
    assert!(args[2].contains("/temp/d1_"), "{}", args[2]);
    assert_eq!(&args[3..], ["--variant", "flatlay"]);

    let (status, content_type, cache_control, bytes) = project.get(url).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/png"));
    assert_eq!(cache_control.as_deref(), Some("no-cache"));
    assert_eq!(bytes, b"png-bytes");
}

#[tokio::test]
async fn showcase_falls_back_to_conventional_file() {
    let project = Project::new(&[(
        "agent3_virtual_showcase_demo.py",
        "echo \"$REFERENCE_BASE\" > output/reference_base.txt\n\
         printf '%s\\n' \"$@\" > output/showcase_args.txt\n\
         printf 'img' > output/d2_showcase.png\n\
         echo 'all done'\n",
    )]);

    let body = json!({
        "design": {"design_id": "d2"},
        "modelConfig": {"gender": "male", "bodyType": "athletic"},
        "reference": "renders/d2__flatlay.png",
    });
    let (status, body) = project
        .post("/api/virtual-showcase", &body.to_string())
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Virtual showcase generated successfully");
    assert_eq!(
        without_cache_buster(body["imageUrl"].as_str().unwrap()),
        "/api/assets?path=output%2Fd2_showcase.png"
    );

    assert_eq!(
        read(&project.path("output/reference_base.txt")).trim(),
        "http://localhost:8000"
    );
    let args = read(&project.path("output/showcase_args.txt"));
    let args: Vec<&str> = args.lines().collect();
    let attrs_at = args.iter().position(|a| *a == "--model-attrs").unwrap();
    let attrs: Value = serde_json::from_str(args[attrs_at + 1]).unwrap();
    assert_eq!(attrs["gender"], "male");
    assert_eq!(attrs["body_type"], "athletic");
    assert_eq!(attrs["age_range"], "25-32");
    let ref_at = args.iter().position(|a| *a == "--reference").unwrap();
    assert_eq!(
        args[ref_at + 1],
        "http://localhost:8000/api/assets?path=renders%2Fd2__flatlay.png"
    );
}

#[tokio::test]
async fn staged_reference_is_readable_by_worker() {
    let project = Project::new(&[(
        "agent3_virtual_showcase_demo.py",
        "while [ $# -gt 0 ]; do\n\
           if [ \"$1\" = --reference ]; then ref=\"$2\"; fi\n\
           shift\n\
         done\n\
         cat \"$ref\" > output/d8_showcase.png || exit 4\n\
         echo 'Saved showcase image: output/d8_showcase.png (9 bytes)'\n",
    )]);
    fs::create_dir_all(project.path("temp")).unwrap();
    fs::write(project.path("temp/upload.png"), "ref-bytes").unwrap();

    let body = json!({"design": {"design_id": "d8"}, "reference": "temp/upload.png"});
    let (status, body) = project
        .post("/api/virtual-showcase", &body.to_string())
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let url = body["imageUrl"].as_str().unwrap();
    assert_eq!(
        without_cache_buster(url),
        "/api/assets?path=output%2Fd8_showcase.png"
    );
    let (status, _, _, bytes) = project.get(url).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"ref-bytes");
}

#[tokio::test]
async fn configured_out_dir_is_searched_for_fallback() {
    let project = Project::with_config(
        &[(
            "agent3_runway_demo.py",
            "printf '%s\\n' \"$@\" > args.txt\n\
             mkdir -p media\n\
             printf 'mp4' > media/d9_runway.mp4\n\
             echo 'encoding done'\n",
        )],
        |config| config.worker.out_dir = "media".to_string(),
    );

    let (status, body) = project.post("/api/runway", &design_body("d9")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(
        without_cache_buster(body["videoUrl"].as_str().unwrap()),
        "/api/assets?path=media%2Fd9_runway.mp4"
    );
    let args = read(&project.path("args.txt"));
    let args: Vec<&str> = args.lines().collect();
    let out_at = args.iter().position(|a| *a == "--out-dir").unwrap();
    assert_eq!(args[out_at + 1], "media");
}

#[tokio::test]
async fn missing_interpreter_is_a_spawn_error_without_paths() {
    let project = Project::with_config(&[("render_utils.py", "echo unreachable\n")], |config| {
        config.worker.interpreter = Interpreter::Explicit(config.root.join(".venv/bin/python"));
    });

    let (status, body) = project.post("/api/generate-flatlay", &design_body("d10")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "E_SPAWN");
    let message = body["error"].as_str().unwrap();
    assert!(message.starts_with("failed to start worker process"), "{message}");
    assert!(!message.contains(project.root.to_str().unwrap()), "{message}");
}

#[tokio::test]
async fn runway_reports_video_and_duration() {
    let project = Project::new(&[(
        "agent3_runway_demo.py",
        "printf 'mp4' > output/d3_runway.mp4\n\
         echo 'Saved: output/storyboard.png'\n\
         echo 'Saved video: output/d3_runway.mp4'\n",
    )]);

    let (status, body) = project.post("/api/runway", &design_body("d3")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["duration"], 6);
    assert_eq!(body["message"], "Runway video generated successfully");
    assert_eq!(
        without_cache_buster(body["videoUrl"].as_str().unwrap()),
        "/api/assets?path=output%2Fd3_runway.mp4"
    );
}

#[tokio::test]
async fn killed_worker_returns_captured_output() {
    let project = Project::new(&[(
        "agent3_runway_demo.py",
        "echo 'rendering frames'\necho 'oom' >&2\nkill -9 $$\n",
    )]);

    let (status, body) = project.post("/api/runway", &design_body("d4")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "E_WORKER_EXIT");
    assert_eq!(body["exit_code"], 137);
    assert!(body["raw_stdout"]
        .as_str()
        .unwrap()
        .contains("rendering frames"));
    assert_eq!(body["raw_stderr"].as_str().unwrap().trim(), "oom");
}

#[tokio::test]
async fn silent_worker_is_artifact_not_found() {
    let project = Project::new(&[("agent3_virtual_showcase_demo.py", "echo 'finished'\n")]);

    let (status, body) = project
        .post("/api/virtual-showcase", &design_body("d5"))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "E_ARTIFACT_NOT_FOUND");
    assert_eq!(body["raw_stdout"].as_str().unwrap().trim(), "finished");
    assert_eq!(body["exit_code"], 0);
}

#[tokio::test]
async fn missing_design_id_is_rejected_before_any_side_effect() {
    let project = Project::new(&[("agent3_runway_demo.py", "touch ran.txt\n")]);

    let body = json!({"design": {"design_text": "no id"}}).to_string();
    let (status, body) = project.post("/api/runway", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "E_VALIDATION");
    assert!(!project.path("temp").exists());
    assert!(!project.path("ran.txt").exists());
}

#[tokio::test]
async fn traversing_reference_is_rejected() {
    let project = Project::new(&[("agent3_virtual_showcase_demo.py", "touch ran.txt\n")]);

    let body = json!({"design": {"design_id": "d6"}, "reference": "output/../secrets/key.txt"});
    let (status, body) = project
        .post("/api/virtual-showcase", &body.to_string())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "E_PATH_SECURITY");
    assert!(!project.path("ran.txt").exists());
}

#[tokio::test]
async fn malformed_json_is_a_validation_error() {
    let project = Project::new(&[]);
    let (status, body) = project.post("/api/generate-flatlay", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "E_VALIDATION");
}

#[tokio::test]
async fn apply_change_reads_written_design() {
    let project = Project::new(&[(
        "apply_text_change.py",
        "test \"$(cat \"$2\")\" = 'make it olive linen' || exit 3\n\
         printf '{\"design_id\":\"42\",\"design_text\":\"olive linen\"}' > temp/design_42.json\n\
         echo 'Wrote: temp/design_42.json'\n",
    )]);

    let body = json!({
        "design": {"design_id": "42", "design_text": "navy wool"},
        "textChange": "make it olive linen",
    });
    let (status, body) = project.post("/api/apply-change", &body.to_string()).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Design updated successfully");
    assert_eq!(body["design"]["design_text"], "olive linen");
    assert_eq!(body["design"]["design_id"], "42");
}

#[tokio::test]
async fn apply_change_accepts_printed_design() {
    let project = Project::new(&[(
        "apply_text_change.py",
        "echo '{\"design_id\":\"7\",\"design_text\":\"linen\"}'\n",
    )]);

    let body = json!({"design": {"design_id": "7"}, "changeText": "linen"});
    let (status, body) = project.post("/api/apply-change", &body.to_string()).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["message"], "Design updated from stdout");
    assert_eq!(body["design"]["design_text"], "linen");
}

#[tokio::test]
async fn apply_change_lists_candidates_when_file_is_missing() {
    let project = Project::new(&[(
        "apply_text_change.py",
        "echo 'Wrote: temp/ghost.json'\n",
    )]);

    let body = json!({"design": {"design_id": "42"}, "textChange": "anything"});
    let (status, body) = project.post("/api/apply-change", &body.to_string()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "E_MUTATION");
    let candidates: Vec<&str> = body["candidates"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(
        candidates,
        [
            "temp/ghost.json",
            "scripts/temp/ghost.json",
            "temp/temp/ghost.json",
            "output/temp/ghost.json",
        ]
    );
}

#[tokio::test]
async fn apply_change_requires_text() {
    let project = Project::new(&[]);
    let body = json!({"design": {"design_id": "42"}, "textChange": "  "});
    let (status, body) = project.post("/api/apply-change", &body.to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "E_VALIDATION");
}

#[tokio::test]
async fn asset_route_enforces_allow_list() {
    let project = Project::new(&[]);
    fs::write(project.path("public/logo.svg"), "<svg/>").unwrap();

    let (status, content_type, cache_control, bytes) =
        project.get("/api/assets?path=public%2Flogo.svg").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/svg+xml"));
    assert_eq!(cache_control.as_deref(), Some("no-cache"));
    assert_eq!(bytes, b"<svg/>");

    let cases = [
        ("/api/assets", StatusCode::BAD_REQUEST),
        ("/api/assets?path=output%2F..%2Fsecrets%2Fkey.txt", StatusCode::BAD_REQUEST),
        ("/api/assets?path=secrets%2Fkey.txt", StatusCode::FORBIDDEN),
        ("/api/assets?path=output%2Fmissing.png", StatusCode::NOT_FOUND),
    ];
    for (uri, expected) in cases {
        let (status, content_type, _, bytes) = project.get(uri).await;
        assert_eq!(status, expected, "{uri}");
        assert_eq!(content_type.as_deref(), Some("application/json"));
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert!(!body["error"]
            .as_str()
            .unwrap()
            .contains(project.root.to_str().unwrap()));
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let project = Project::new(&[]);
    let (status, _, _, bytes) = project.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
}
