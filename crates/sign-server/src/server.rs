use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::codec::{EnvelopeCipher, open_request, seal_data};
use crate::documents::DocumentStore;
use crate::error::ServerError;
use crate::signing::{SigningBackend, SigningResult};

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn SigningBackend>,
    pub cipher: EnvelopeCipher,
    pub documents: DocumentStore,
}

/// Envelope shared by every endpoint: `{"code": .., "msg": .., "data": ..}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    code: u16,
    msg: String,
    data: Value,
}

impl ApiResponse {
    pub fn ok(msg: impl Into<String>, data: Value) -> Self {
        Self {
            code: StatusCode::OK.as_u16(),
            msg: msg.into(),
            data,
        }
    }

    pub fn failure(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            msg: msg.into(),
            data: Value::Bool(false),
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(describe))
        .route("/health", get(health))
        .route("/getCode", post(get_code))
        .route("/xml-files/list", post(list_documents))
        .route("/xml-files/add", post(add_document))
        .route("/xml-files/delete", post(delete_document))
        .with_state(state)
}

pub async fn run(host: String, port: u16, state: AppState) -> Result<()> {
    let backend = Arc::clone(&state.backend);

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    info!(addr = %listener.local_addr()?, backend = backend.name(), "sign server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    backend.shutdown().await;
    info!("sign server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "cannot listen for ctrl-c, running until killed");
        futures::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn backend_status(backend: &dyn SigningBackend) -> &'static str {
    if backend.is_available() {
        "healthy"
    } else {
        "backend_not_available"
    }
}

async fn describe(State(state): State<AppState>) -> Json<Value> {
    let status = if state.backend.is_available() {
        "running"
    } else {
        "backend_not_available"
    };
    Json(json!({
        "service": "Sign Server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": status,
        "backend": state.backend.name(),
        "endpoints": {
            "xml_files": {
                "list": {"method": "POST", "path": "/xml-files/list"},
                "add": {"method": "POST", "path": "/xml-files/add"},
                "delete": {"method": "POST", "path": "/xml-files/delete"},
            },
            "sign": {
                "getCode": {"method": "POST", "path": "/getCode"},
            },
            "health": {"method": "GET", "path": "/health"},
        }
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "code": 200,
        "msg": "service is running",
        "data": true,
        "backend_status": backend_status(state.backend.as_ref()),
    }))
}

async fn get_code(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<ApiResponse, ServerError> {
    if !state.backend.is_available() {
        return Err(ServerError::BackendUnavailable(state.backend.name().to_string()));
    }

    info!("received getCode request");
    let request = into_object(open_request(&state.cipher, &body)?)?;
    let data = required_str(&request, "str")?;
    let password = required_str(&request, "pwdstr")?;

    let code = state.backend.get_code(data, password).await?;
    info!(len = code.len(), "getCode succeeded");

    let result = SigningResult::from_code(&code)?;
    let sealed = seal_data(
        &state.cipher,
        json!({
            "sign": result.signature,
            "certNo": result.certificate_number,
        }),
    );
    Ok(ApiResponse::ok("success", sealed))
}

async fn list_documents(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<ApiResponse, ServerError> {
    info!("received xml-files/list request");
    let request = open_request(&state.cipher, &body)?;
    let directory = match &request {
        Value::Object(fields) => optional_str(fields, "directory")?,
        _ => None,
    };
    let dir = state.documents.resolve(directory);

    let documents = state.documents.list(&dir).await?;
    info!(count = documents.len(), dir = %dir.display(), "listed documents");

    let data = serde_json::to_value(documents).map_err(eyre::Report::from)?;
    Ok(ApiResponse::ok("query succeeded", seal_data(&state.cipher, data)))
}

async fn add_document(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<ApiResponse, ServerError> {
    info!("received xml-files/add request");
    let request = into_object(open_request(&state.cipher, &body)?)?;
    let filename = non_empty_str(&request, "filename")?;
    let xml = non_empty_str(&request, "xml")?;
    let dir = state.documents.resolve(optional_str(&request, "directory")?);

    state.documents.save(filename, xml, &dir).await?;
    Ok(ApiResponse::ok("created", Value::Bool(true)))
}

async fn delete_document(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<ApiResponse, ServerError> {
    info!("received xml-files/delete request");
    let request = into_object(open_request(&state.cipher, &body)?)?;
    let filename = non_empty_str(&request, "filename")?;
    let dir = state.documents.resolve(optional_str(&request, "directory")?);

    state.documents.delete(filename, &dir).await?;
    Ok(ApiResponse::ok("deleted", Value::Bool(true)))
}

fn into_object(value: Value) -> Result<Map<String, Value>, ServerError> {
    match value {
        Value::Object(fields) => Ok(fields),
        _ => Err(ServerError::BadRequest("request data must be a JSON object".into())),
    }
}

fn required_str<'a>(fields: &'a Map<String, Value>, key: &str) -> Result<&'a str, ServerError> {
    match fields.get(key) {
        None | Some(Value::Null) => {
            Err(ServerError::BadRequest(format!("missing required field: {key}")))
        }
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ServerError::BadRequest(format!("`{key}` must be a string"))),
    }
}

fn non_empty_str<'a>(fields: &'a Map<String, Value>, key: &str) -> Result<&'a str, ServerError> {
    let value = required_str(fields, key)?;
    if value.is_empty() {
        return Err(ServerError::BadRequest(format!("`{key}` must not be empty")));
    }
    Ok(value)
}

fn optional_str<'a>(
    fields: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, ServerError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(ServerError::BadRequest(format!("`{key}` must be a string"))),
    }
}
