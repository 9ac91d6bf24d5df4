use bytes::{Bytes, BytesMut};
use futures::future;
use hyper::{body::HttpBody, http, Body, Request, Response};
use oauth2_proxy_injector_k8s_api as k8s;
use oauth2_proxy_injector_mutation::{mutate_service, PodMutator};
use serde::de::DeserializeOwned;
use std::{sync::Arc, task, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

type AdmissionRequest = k8s::admission::AdmissionRequest<k8s::DynamicObject>;
type AdmissionResponse = k8s::admission::AdmissionResponse;
type AdmissionReview = k8s::admission::AdmissionReview<k8s::DynamicObject>;

/// Admission requests larger than this are rejected outright.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Deadline for reading a request body.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

/// HTTP service carrying the pod and Service mutation planners.
#[derive(Clone)]
pub struct WebhookService {
    mutator: Arc<PodMutator>,
    client: k8s::Client,
}

// === impl WebhookService ===

impl hyper::service::Service<Request<Body>> for WebhookService {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let svc = self.clone();
        Box::pin(async move { svc.handle(req).await })
    }
}

impl WebhookService {
    pub fn new(mutator: Arc<PodMutator>, client: k8s::Client) -> Self {
        Self { mutator, client }
    }

    async fn handle(self, req: Request<Body>) -> Result<Response<Body>, Error> {
        match req.uri().path() {
            "/healthz" => Ok(handle_health(&req)),
            "/readyz" => Ok(self.handle_ready(&req).await),
            "/mutate" | "/mutate-pod" => self.handle_mutate(req, Route::Pod).await,
            "/mutate-service" => self.handle_mutate(req, Route::Service).await,
            _ => Ok(status_response(http::StatusCode::NOT_FOUND)),
        }
    }

    async fn handle_ready(&self, req: &Request<Body>) -> Response<Body> {
        match *req.method() {
            http::Method::GET | http::Method::HEAD => {}
            _ => return status_response(http::StatusCode::METHOD_NOT_ALLOWED),
        }

        // Ready means the cluster API answers; a webhook that can't read
        // ConfigMaps would deny every opted-in pod.
        match self.client.apiserver_version().await {
            Ok(_) => status_response(http::StatusCode::OK),
            Err(error) => {
                warn!(%error, "readiness check failed");
                status_response(http::StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }

    async fn handle_mutate(self, req: Request<Body>, route: Route) -> Result<Response<Body>, Error> {
        if req.method() != http::Method::POST {
            return Ok(status_response(http::StatusCode::METHOD_NOT_ALLOWED));
        }
        if !has_json_content_type(&req) {
            return Ok(status_response(http::StatusCode::UNSUPPORTED_MEDIA_TYPE));
        }

        let body = match tokio::time::timeout(READ_TIMEOUT, read_body(req.into_body())).await {
            Err(_) => return Ok(status_response(http::StatusCode::REQUEST_TIMEOUT)),
            Ok(Err(BodyError::TooLarge)) => {
                return Ok(status_response(http::StatusCode::PAYLOAD_TOO_LARGE))
            }
            Ok(Err(BodyError::Read(e))) => return Err(e.into()),
            Ok(Ok(bytes)) => bytes,
        };

        let review: AdmissionReview = match serde_json::from_slice(&body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "failed to parse admission review");
                return Ok(bad_request(format!("invalid admission review: {error}")));
            }
        };
        let req: AdmissionRequest = match review.try_into() {
            Ok(req) => req,
            Err(error) => {
                warn!(%error, "invalid admission request");
                return Ok(bad_request(format!("invalid admission request: {error}")));
            }
        };
        debug!(uid = %req.uid, kind = %req.kind.kind, operation = ?req.operation, "admission request");

        let rsp = match route {
            Route::Pod => self.admit_pod(req).await,
            Route::Service => admit_service(req),
        };
        json_response(rsp.into_review())
    }

    async fn admit_pod(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        // Anything other than a Pod CREATE passes through untouched.
        if !is_kind::<k8s::Pod>(&req) || !matches!(req.operation, k8s::admission::Operation::Create)
        {
            return rsp;
        }
        let Some(obj) = req.object else {
            return rsp.deny("admission request has no object");
        };
        let name = obj.metadata.name.clone().unwrap_or_default();
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();

        let pod: k8s::Pod = match parse_object(obj) {
            Ok(pod) => pod,
            Err(error) => {
                info!(%error, %namespace, %name, "failed to decode pod");
                return rsp.deny(format!("failed to decode pod: {error}"));
            }
        };

        match self.mutator.mutate(&pod).await {
            Ok(ops) if ops.is_empty() => rsp,
            Ok(ops) => {
                info!(%namespace, %name, ops = ops.len(), "injecting oauth2-proxy sidecar");
                with_patch(rsp, ops)
            }
            Err(error) => {
                info!(%error, %namespace, %name, "denied pod admission");
                rsp.deny(error.to_string())
            }
        }
    }
}

fn admit_service(req: AdmissionRequest) -> AdmissionResponse {
    let rsp = AdmissionResponse::from(&req);

    if !is_kind::<k8s::Service>(&req)
        || !matches!(req.operation, k8s::admission::Operation::Create)
    {
        return rsp;
    }
    let Some(obj) = req.object else {
        return rsp.deny("admission request has no object");
    };
    let name = obj.metadata.name.clone().unwrap_or_default();
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();

    let svc: k8s::Service = match parse_object(obj) {
        Ok(svc) => svc,
        Err(error) => {
            info!(%error, %namespace, %name, "failed to decode service");
            return rsp.deny(format!("failed to decode service: {error}"));
        }
    };

    match mutate_service(&svc) {
        Ok(ops) if ops.is_empty() => rsp,
        Ok(ops) => {
            info!(%namespace, %name, ops = ops.len(), "rewriting service ports");
            with_patch(rsp, ops)
        }
        Err(error) => {
            info!(%error, %namespace, %name, "denied service admission");
            rsp.deny(error.to_string())
        }
    }
}

enum Route {
    Pod,
    Service,
}

fn handle_health(req: &Request<Body>) -> Response<Body> {
    match *req.method() {
        http::Method::GET | http::Method::HEAD => status_response(http::StatusCode::OK),
        _ => status_response(http::StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: k8s::Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn parse_object<T: DeserializeOwned>(obj: k8s::DynamicObject) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(obj)?)
}

fn with_patch(rsp: AdmissionResponse, ops: Vec<json_patch::PatchOperation>) -> AdmissionResponse {
    rsp.clone()
        .with_patch(json_patch::Patch(ops))
        .unwrap_or_else(|error| {
            warn!(%error, "failed to serialize patch");
            rsp.deny(format!("failed to serialize patch: {error}"))
        })
}

fn has_json_content_type(req: &Request<Body>) -> bool {
    req.headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim())
        == Some("application/json")
}

enum BodyError {
    TooLarge,
    Read(hyper::Error),
}

/// Reads the request body, bounded by [`MAX_BODY_BYTES`].
async fn read_body(mut body: Body) -> Result<Bytes, BodyError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if buf.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(BodyError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn status_response(status: http::StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("status response must be valid")
}

fn bad_request(message: String) -> Response<Body> {
    Response::builder()
        .status(http::StatusCode::BAD_REQUEST)
        .body(Body::from(message))
        .expect("bad request response must be valid")
}

fn json_response(review: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&review)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::Service;
    use oauth2_proxy_injector_config::ConfigMapLoader;

    fn service() -> WebhookService {
        // The client is never dialed in these tests; annotation-only pods
        // keep the loader idle.
        let config = k8s::Config::new(
            "https://127.0.0.1:6443"
                .parse()
                .expect("test cluster url must be valid"),
        );
        let client = k8s::Client::try_from(config).expect("test client must build");
        let loader = Arc::new(ConfigMapLoader::new(client.clone(), "auth-system"));
        let mutator = Arc::new(PodMutator::new(loader, None, "auth-system", "alpine:3.20"));
        WebhookService::new(mutator, client)
    }

    fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn pod_review(pod: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "namespace": "media",
                "operation": "CREATE",
                "userInfo": {},
                "object": pod,
            }
        })
    }

    async fn call(req: Request<Body>) -> Response<Body> {
        service().call(req).await.unwrap()
    }

    async fn body_json(rsp: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(rsp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn enabled_pod() -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "pod-0",
                "namespace": "media",
                "annotations": {
                    "spacemule.net/oauth2-proxy.enabled": "true",
                    "spacemule.net/oauth2-proxy.protected-port": "http",
                    "spacemule.net/oauth2-proxy.provider": "github",
                    "spacemule.net/oauth2-proxy.client-id": "injector",
                    "spacemule.net/oauth2-proxy.cookie-secret-ref": "oauth-secrets:cookie",
                    "spacemule.net/oauth2-proxy.pkce-enabled": "true",
                }
            },
            "spec": {
                "containers": [{
                    "name": "app",
                    "image": "app:1",
                    "ports": [{"name": "http", "containerPort": 8080}],
                }]
            }
        })
    }

    #[tokio::test]
    async fn mutate_requires_post() {
        let req = Request::builder()
            .method(http::Method::GET)
            .uri("/mutate")
            .body(Body::empty())
            .unwrap();
        let rsp = call(req).await;
        assert_eq!(rsp.status(), http::StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn mutate_requires_json_content_type() {
        let req = Request::builder()
            .method(http::Method::POST)
            .uri("/mutate")
            .header(http::header::CONTENT_TYPE, "text/plain")
            .body(Body::from("{}"))
            .unwrap();
        let rsp = call(req).await;
        assert_eq!(rsp.status(), http::StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn content_type_parameters_are_accepted() {
        let req = Request::builder()
            .method(http::Method::POST)
            .uri("/mutate")
            .header(http::header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Body::from(
                serde_json::to_vec(&pod_review(enabled_pod())).unwrap(),
            ))
            .unwrap();
        let rsp = call(req).await;
        assert_eq!(rsp.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let req = Request::builder()
            .method(http::Method::POST)
            .uri("/mutate")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let rsp = call(req).await;
        assert_eq!(rsp.status(), http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let req = Request::builder()
            .method(http::Method::GET)
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let rsp = call(req).await;
        assert_eq!(rsp.status(), http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let req = Request::builder()
            .method(http::Method::GET)
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let rsp = call(req).await;
        assert_eq!(rsp.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn pod_mutation_returns_base64_json_patch() {
        let rsp = call(post_json("/mutate", pod_review(enabled_pod()))).await;
        assert_eq!(rsp.status(), http::StatusCode::OK);

        let review = body_json(rsp).await;
        let response = &review["response"];
        assert_eq!(response["allowed"], true);
        assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response["patchType"], "JSONPatch");

        use base64::Engine;
        let patch = base64::engine::general_purpose::STANDARD
            .decode(response["patch"].as_str().unwrap())
            .unwrap();
        let ops: serde_json::Value = serde_json::from_slice(&patch).unwrap();
        let arr = ops.as_array().unwrap();
        assert_eq!(arr[0]["path"], "/spec/containers/-");
        assert_eq!(arr[0]["value"]["name"], "oauth2-proxy");
    }

    #[tokio::test]
    async fn disabled_pod_is_allowed_without_patch() {
        let pod = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "pod-0", "namespace": "media"},
            "spec": {"containers": [{"name": "app", "image": "app:1"}]}
        });
        let review = body_json(call(post_json("/mutate", pod_review(pod))).await).await;
        assert_eq!(review["response"]["allowed"], true);
        assert!(review["response"]["patch"].is_null());
    }

    #[tokio::test]
    async fn planner_failure_denies_with_message() {
        // Protected port names a port the pod doesn't expose.
        let mut pod = enabled_pod();
        pod["metadata"]["annotations"]["spacemule.net/oauth2-proxy.protected-port"] =
            serde_json::json!("9090");
        let review = body_json(call(post_json("/mutate", pod_review(pod))).await).await;
        assert_eq!(review["response"]["allowed"], false);
        let message = review["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains("9090"), "unexpected message: {message}");
    }

    #[tokio::test]
    async fn non_pod_kind_passes_through() {
        let mut review = pod_review(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "deploy-0", "namespace": "media"},
        }));
        review["request"]["kind"] =
            serde_json::json!({"group": "apps", "version": "v1", "kind": "Deployment"});
        let review = body_json(call(post_json("/mutate", review)).await).await;
        assert_eq!(review["response"]["allowed"], true);
        assert!(review["response"]["patch"].is_null());
    }

    #[tokio::test]
    async fn non_create_operation_passes_through() {
        let mut review = pod_review(enabled_pod());
        review["request"]["operation"] = serde_json::json!("UPDATE");
        let review = body_json(call(post_json("/mutate", review)).await).await;
        assert_eq!(review["response"]["allowed"], true);
        assert!(review["response"]["patch"].is_null());
    }

    #[tokio::test]
    async fn service_mutation_rewrites_target_port() {
        let svc = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "svc-0",
                "namespace": "media",
                "annotations": {"spacemule.net/oauth2-proxy.rewrite-ports": "hls"},
            },
            "spec": {
                "ports": [
                    {"name": "http", "port": 80, "targetPort": "http"},
                    {"name": "hls", "port": 8888, "targetPort": 8554},
                ]
            }
        });
        let mut review = pod_review(svc);
        review["request"]["kind"] =
            serde_json::json!({"group": "", "version": "v1", "kind": "Service"});
        review["request"]["resource"] =
            serde_json::json!({"group": "", "version": "v1", "resource": "services"});

        let review = body_json(call(post_json("/mutate-service", review)).await).await;
        assert_eq!(review["response"]["allowed"], true);

        use base64::Engine;
        let patch = base64::engine::general_purpose::STANDARD
            .decode(review["response"]["patch"].as_str().unwrap())
            .unwrap();
        let ops: serde_json::Value = serde_json::from_slice(&patch).unwrap();
        let arr = ops.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(
            arr[0]["path"],
            "/metadata/annotations/spacemule.net~1oauth2-proxy.original-target.hls"
        );
        assert_eq!(arr[0]["value"], "8554");
        assert_eq!(arr[1]["path"], "/spec/ports/1/targetPort");
        assert_eq!(arr[1]["value"], 4180);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let big = vec![b' '; MAX_BODY_BYTES + 1];
        let req = Request::builder()
            .method(http::Method::POST)
            .uri("/mutate")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(big))
            .unwrap();
        let rsp = call(req).await;
        assert_eq!(rsp.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
    }
}
