use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use sign_server::{
    AppState, DocumentStore, EnvelopeCipher, SigningBackend, SigningError, SigningRequest,
    SigningResult, router,
};
use tower::ServiceExt;

const KEY: &str = "1234567887654321";

struct StubBackend {
    available: bool,
    outcome: fn(&SigningRequest) -> Result<SigningResult, SigningError>,
}

#[async_trait]
impl SigningBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn sign(&self, request: &SigningRequest) -> Result<SigningResult, SigningError> {
        (self.outcome)(request)
    }
}

fn signs(request: &SigningRequest) -> Result<SigningResult, SigningError> {
    SigningResult::new(format!("SIG({})", request.payload()), "01A2B3C4")
}

fn rejects(_: &SigningRequest) -> Result<SigningResult, SigningError> {
    Err(SigningError::Rejected {
        errors: vec!["wrong pin".into()],
    })
}

fn state(backend: StubBackend, dir: &Path) -> AppState {
    AppState {
        backend: Arc::new(backend),
        cipher: EnvelopeCipher::new(KEY).unwrap(),
        documents: DocumentStore::new(dir),
    }
}

fn working(dir: &Path) -> AppState {
    state(
        StubBackend {
            available: true,
            outcome: signs,
        },
        dir,
    )
}

fn cipher() -> EnvelopeCipher {
    EnvelopeCipher::new(KEY).unwrap()
}

async fn post(state: AppState, uri: &str, body: impl Into<Body>) -> (StatusCode, Value) {
    let response = router(state)
        .oneshot(Request::builder().method("POST").uri(uri).body(body.into()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_sealed(state: AppState, uri: &str, request: Value) -> (StatusCode, Value) {
    post(state, uri, cipher().encrypt(&request.to_string())).await
}

fn open_data(body: &Value) -> Value {
    let ciphertext = body["data"].as_str().expect("sealed data");
    serde_json::from_str(&cipher().decrypt(ciphertext).unwrap()).unwrap()
}

#[tokio::test]
async fn get_code_returns_sealed_signature() {
    let tmp = tempfile::tempdir().unwrap();
    let request = json!({"str": "data", "pwdstr": "88888888"});
    let (status, body) = post_sealed(working(tmp.path()), "/getCode", request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 200);
    assert_eq!(body["msg"], "success");
    assert_eq!(open_data(&body), json!({"sign": "SIG(data)", "certNo": "01A2B3C4"}));
}

#[tokio::test]
async fn get_code_accepts_known_ciphertext() {
    let tmp = tempfile::tempdir().unwrap();
    let body = "FF0352DCB286AA07669FC48EE9AED09F20FB6374FFE29584EC75FC25D430DB3F05127F4B496F6C1EEDF539E43B20E2D3";
    let (status, body) = post(working(tmp.path()), "/getCode", body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(open_data(&body)["sign"], "SIG(data)");
}

#[tokio::test]
async fn get_code_with_unavailable_backend_is_500() {
    let tmp = tempfile::tempdir().unwrap();
    let state = state(
        StubBackend {
            available: false,
            outcome: signs,
        },
        tmp.path(),
    );
    // never decrypted, so garbage is fine
    let (status, body) = post(state, "/getCode", "not hex").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], 500);
    assert_eq!(body["data"], false);
}

#[tokio::test]
async fn get_code_rejects_bad_envelopes() {
    let tmp = tempfile::tempdir().unwrap();

    let (status, _) = post(working(tmp.path()), "/getCode", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(working(tmp.path()), "/getCode", "ABC").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // a valid block whose padding is invalid
    let bad_padding = "313CE715E70DD913113BD2CA3AE5F6F0";
    let (status, _) = post(working(tmp.path()), "/getCode", bad_padding).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(working(tmp.path()), "/getCode", cipher().encrypt("not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_code_validates_fields() {
    let tmp = tempfile::tempdir().unwrap();

    for request in [
        json!({"pwdstr": "88888888"}),
        json!({"str": "data"}),
        json!({"str": 1, "pwdstr": "88888888"}),
        json!({"str": "", "pwdstr": "88888888"}),
        json!(["data", "88888888"]),
    ] {
        let (status, body) = post_sealed(working(tmp.path()), "/getCode", request.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{request}");
        assert_eq!(body["code"], 400);
    }
}

#[tokio::test]
async fn get_code_reports_signing_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let state = state(
        StubBackend {
            available: true,
            outcome: rejects,
        },
        tmp.path(),
    );
    let request = json!({"str": "data", "pwdstr": "0000"});
    let (status, body) = post_sealed(state, "/getCode", request).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["msg"].as_str().unwrap().contains("wrong pin"));
}

#[tokio::test]
async fn documents_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("xml");

    let request = json!({"filename": "order", "xml": "<o/>"});
    let (status, body) = post_sealed(working(&dir), "/xml-files/add", request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], true);
    assert!(dir.join("order.xml").is_file());

    let (status, body) = post_sealed(working(&dir), "/xml-files/list", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(open_data(&body), json!([{"filename": "order.xml", "xml": "<o/>"}]));

    let request = json!({"filename": "order.xml"});
    let (status, _) = post_sealed(working(&dir), "/xml-files/delete", request.clone()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_sealed(working(&dir), "/xml-files/delete", request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn documents_honor_directory_override() {
    let tmp = tempfile::tempdir().unwrap();
    let default_dir = tmp.path().join("default");
    let other = tmp.path().join("other");
    let directory = other.to_str().unwrap();

    let request = json!({"filename": "a.xml", "xml": "<a/>", "directory": directory});
    let (status, _) = post_sealed(working(&default_dir), "/xml-files/add", request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(other.join("a.xml").is_file());

    let (_, body) = post_sealed(working(&default_dir), "/xml-files/list", json!({})).await;
    assert_eq!(open_data(&body), json!([]));

    let request = json!({"directory": directory});
    let (_, body) = post_sealed(working(&default_dir), "/xml-files/list", request).await;
    assert_eq!(open_data(&body)[0]["filename"], "a.xml");
}

#[tokio::test]
async fn add_requires_filename_and_xml() {
    let tmp = tempfile::tempdir().unwrap();
    let request = json!({"filename": "a"});
    let (status, _) = post_sealed(working(tmp.path()), "/xml-files/add", request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = json!({"filename": "", "xml": "<a/>"});
    let (status, _) = post_sealed(working(tmp.path()), "/xml-files/add", request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_reports_backend_status() {
    let tmp = tempfile::tempdir().unwrap();
    let state = state(
        StubBackend {
            available: false,
            outcome: signs,
        },
        tmp.path(),
    );
    let response = router(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["backend_status"], "backend_not_available");
}

#[tokio::test]
async fn root_describes_service() {
    let tmp = tempfile::tempdir().unwrap();
    let response = router(working(tmp.path()))
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], "running");
    assert_eq!(body["endpoints"]["sign"]["getCode"]["path"], "/getCode");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let tmp = tempfile::tempdir().unwrap();
    let response = router(working(tmp.path()))
        .oneshot(Request::builder().uri("/nonexistent").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
