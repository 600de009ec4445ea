//! The JSON API for reading and scaling deployments.
//!
//! | Route                 | Method | Response                          |
//! |-----------------------|--------|-----------------------------------|
//! | `/healthz`            | GET    | `{"status":"OK"}` once synced     |
//! | `/replica-count`      | GET    | `{"replicaCount":n}`              |
//! | `/replica-count`      | POST   | `{"replicaCount":n}`              |
//! | `/deployments`        | GET    | `{"deployments":["ns/name",...]}` |
//!
//! Errors are reported as `{"message":...,"code":...}`.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]


use bytes::Bytes;
use deployment_scaler_core::{
    Error as DeploymentError, ObjectKey, QueryDeployments, ScaleDeployments,
};
use futures::future;
use http_body_util::{BodyExt, Limited};
use hyper::{http, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, info, trace, warn};

/// Serves the API against a set of mirrored deployments.
#[derive(Clone, Debug)]
pub struct Api<T> {
    deployments: T,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Body = http_body_util::Full<Bytes>;

/// Requests with larger bodies are rejected.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug)]
struct Query {
    namespace: String,
    deployment: String,
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    replicas: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplicaCount {
    replica_count: i32,
}

#[derive(Debug, Serialize)]
struct DeploymentList {
    deployments: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Status {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ApiError<'m> {
    message: &'m str,
    code: u16,
}

// === impl Api ===

impl<T> Api<T>
where
    T: QueryDeployments + ScaleDeployments + Clone + Send + Sync + 'static,
{
    pub fn new(deployments: T) -> Self {
        Self { deployments }
    }

    /// Reads the request body, up to [`MAX_BODY_BYTES`], and routes the request.
    pub async fn serve<B>(&self, req: Request<B>) -> Result<Response<Body>, Error>
    where
        B: hyper::body::Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let start = time::Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, %path, "Request started");

        let (parts, body) = req.into_parts();
        let rsp = match Limited::new(body, MAX_BODY_BYTES).collect().await {
            Ok(body) => self.handle(Request::from_parts(parts, body.to_bytes())).await?,
            Err(error) => {
                debug!(%error, "Failed to read request body");
                error_response(http::StatusCode::BAD_REQUEST, "Invalid request body")?
            }
        };

        info!(
            %method,
            %path,
            status = rsp.status().as_u16(),
            elapsed = ?start.elapsed(),
            "Request completed"
        );
        Ok(rsp)
    }

    /// Routes a request whose body has already been read.
    pub async fn handle(&self, req: Request<Bytes>) -> Result<Response<Body>, Error> {
        trace!(?req);
        match (req.uri().path(), req.method()) {
            ("/healthz", &http::Method::GET) => self.health(),
            ("/replica-count", &http::Method::GET) => self.get_replica_count(&req),
            ("/replica-count", &http::Method::POST) => self.post_replica_count(&req).await,
            ("/deployments", &http::Method::GET) => self.list_deployments(&req),
            ("/healthz" | "/replica-count" | "/deployments", _) => {
                error_response(http::StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
            }
            _ => error_response(http::StatusCode::NOT_FOUND, "Not found"),
        }
    }

    fn health(&self) -> Result<Response<Body>, Error> {
        if !self.deployments.is_ready() {
            return error_response(
                http::StatusCode::SERVICE_UNAVAILABLE,
                "Deployment cache not synced",
            );
        }
        json_response(http::StatusCode::OK, &Status { status: "OK" })
    }

    fn get_replica_count(&self, req: &Request<Bytes>) -> Result<Response<Body>, Error> {
        let key = match target(req) {
            Ok(key) => key,
            Err(error) => return deployment_error(error),
        };
        match self.deployments.query_single(&key) {
            Ok(obj) => json_response(
                http::StatusCode::OK,
                &ReplicaCount {
                    replica_count: obj.replicas,
                },
            ),
            Err(error) => deployment_error(error),
        }
    }

    async fn post_replica_count(&self, req: &Request<Bytes>) -> Result<Response<Body>, Error> {
        let key = match target(req) {
            Ok(key) => key,
            Err(error) => return deployment_error(error),
        };
        let ScaleRequest { replicas } = match serde_json::from_slice(req.body()) {
            Ok(body) => body,
            Err(error) => {
                debug!(%error, "Invalid request body");
                return error_response(http::StatusCode::BAD_REQUEST, "Invalid request body");
            }
        };
        match self.deployments.mutate(&key, replicas).await {
            Ok(replica_count) => {
                json_response(http::StatusCode::OK, &ReplicaCount { replica_count })
            }
            Err(error) => deployment_error(error),
        }
    }

    fn list_deployments(&self, req: &Request<Bytes>) -> Result<Response<Body>, Error> {
        let Query { namespace, .. } = query(req);
        let namespace = (!namespace.is_empty()).then_some(namespace.as_str());
        let deployments = self
            .deployments
            .query_list(namespace)
            .into_iter()
            .map(|key| key.to_string())
            .collect();
        json_response(http::StatusCode::OK, &DeploymentList { deployments })
    }
}

impl<T> tower::Service<Request<hyper::body::Incoming>> for Api<T>
where
    T: QueryDeployments + ScaleDeployments + Clone + Send + Sync + 'static,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        let api = self.clone();
        Box::pin(async move { api.serve(req).await })
    }
}

/// Decodes the query string. When a parameter is repeated, its first value is used.
fn query(req: &Request<Bytes>) -> Query {
    let pairs = req
        .uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok())
        .unwrap_or_default();

    let (mut namespace, mut deployment) = (None, None);
    for (k, v) in pairs {
        match k.as_str() {
            "namespace" => namespace = namespace.or(Some(v)),
            "deployment" => deployment = deployment.or(Some(v)),
            _ => {}
        }
    }
    Query {
        namespace: namespace.unwrap_or_default(),
        deployment: deployment.unwrap_or_default(),
    }
}

/// Reads the target deployment from the query string.
fn target(req: &Request<Bytes>) -> Result<ObjectKey, DeploymentError> {
    let Query {
        namespace,
        deployment,
    } = query(req);
    let key = ObjectKey::new(namespace, deployment);
    key.validate()?;
    Ok(key)
}

fn deployment_error(error: DeploymentError) -> Result<Response<Body>, Error> {
    match error {
        DeploymentError::InvalidInput(msg) => error_response(http::StatusCode::BAD_REQUEST, &msg),
        DeploymentError::NotFound(key) => {
            debug!(%key, "Deployment not found");
            error_response(http::StatusCode::NOT_FOUND, "Deployment not found")
        }
        DeploymentError::WriteFailed { key, source } => {
            warn!(%key, error = %source, "Failed to update deployment scale");
            error_response(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to update deployment scale",
            )
        }
    }
}

fn error_response(status: http::StatusCode, message: &str) -> Result<Response<Body>, Error> {
    json_response(
        status,
        &ApiError {
            message,
            code: status.as_u16(),
        },
    )
}

fn json_response(
    status: http::StatusCode,
    body: &impl Serialize,
) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(body)?;
    Ok(Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("json response must be valid"))
}
