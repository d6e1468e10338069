use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::BackendApi;
use crate::cache::ResponseCache;
use crate::error::{fail, ApiError, GatewayError, RouteKind};
use crate::models::{
    AssistantDatasetsInput, AssistantInput, AssistantPatch, ChatMessage, Credentials, DatasetInput, DatasetPatch,
    FileUpload, TextDocumentInput,
};
use crate::session::{append_set_cookies, AuthSession, CookiePolicy, SessionContext};

#[derive(Clone)]
pub struct AppState {
    pub api: BackendApi,
    pub cookies: CookiePolicy,
    pub cache: Option<ResponseCache>,
    pub metrics: Option<PrometheusHandle>,
}

type ApiResult<T> = Result<T, ApiError>;

fn success() -> Json<Value> {
    Json(json!({ "success": true }))
}

/// Missing session is a 401 before anything else is looked at.
fn authorized(session: &SessionContext) -> ApiResult<()> {
    session.require_token().map(|_| ()).map_err(|_| ApiError::unauthorized())
}

fn parse<T: DeserializeOwned>(body: Value) -> ApiResult<T> {
    serde_json::from_value(body).map_err(|e| ApiError::bad_request(format!("Missing or invalid fields: {e}")))
}

// --- auth ---------------------------------------------------------------

fn establish(state: &AppState, result: Result<Option<AuthSession>, GatewayError>) -> ApiResult<Response> {
    let session = result
        .map_err(fail(RouteKind::Auth))?
        .ok_or_else(|| ApiError::internal("No access token received"))?;
    let mut headers = HeaderMap::new();
    append_set_cookies(&mut headers, state.cookies.set_session(&session));
    Ok((headers, success()).into_response())
}

async fn login(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult<Response> {
    let creds: Credentials = parse(body)?;
    let result = state.api.sign_in(&creds).await;
    establish(&state, result)
}

async fn signup(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult<Response> {
    let creds: Credentials = parse(body)?;
    let result = state.api.sign_up(&creds).await;
    establish(&state, result)
}

async fn logout(State(state): State<AppState>) -> Response {
    let mut headers = HeaderMap::new();
    append_set_cookies(&mut headers, state.cookies.clear_session());
    (headers, success()).into_response()
}

async fn me(State(state): State<AppState>, session: SessionContext) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    state.api.current_user(&session).await.map(Json).map_err(fail(RouteKind::Auth))
}

// --- assistants ---------------------------------------------------------

async fn list_assistants(State(state): State<AppState>, session: SessionContext) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    state.api.list_assistants(&session).await.map(Json).map_err(fail(RouteKind::List))
}

async fn create_assistant(
    State(state): State<AppState>,
    session: SessionContext,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    authorized(&session)?;
    let input: AssistantInput = parse(body)?;
    let created = state.api.create_assistant(&session, &input).await.map_err(fail(RouteKind::Mutation))?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_assistant(State(state): State<AppState>, session: SessionContext, Path(id): Path<u64>) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    state.api.get_assistant(&session, id).await.map(Json).map_err(fail(RouteKind::Item))
}

async fn update_assistant(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<u64>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    let patch: AssistantPatch = parse(body)?;
    state.api.update_assistant(&session, id, &patch).await.map(Json).map_err(fail(RouteKind::Mutation))
}

async fn delete_assistant(State(state): State<AppState>, session: SessionContext, Path(id): Path<u64>) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    state.api.delete_assistant(&session, id).await.map_err(fail(RouteKind::Mutation))?;
    Ok(success())
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    #[serde(default)]
    message: String,
}

async fn send_chat(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<u64>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    let body: ChatBody = parse(body)?;
    state.api.send_chat_message(&session, id, &body.message).await.map(Json).map_err(fail(RouteKind::Mutation))
}

async fn chat_messages(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<u64>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    authorized(&session)?;
    state.api.chat_messages(&session, id).await.map(Json).map_err(fail(RouteKind::List))
}

async fn assistant_datasets(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<u64>,
) -> ApiResult<Json<Vec<u64>>> {
    authorized(&session)?;
    state.api.assistant_dataset_ids(&session, id).await.map(Json).map_err(fail(RouteKind::List))
}

async fn set_assistant_datasets(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<u64>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    let input: AssistantDatasetsInput = parse(body)?;
    state
        .api
        .set_assistant_datasets(&session, id, &input.dataset_ids)
        .await
        .map_err(fail(RouteKind::Mutation))?;
    Ok(success())
}

// --- datasets -----------------------------------------------------------

async fn list_datasets(State(state): State<AppState>, session: SessionContext) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    state.api.list_datasets(&session).await.map(Json).map_err(fail(RouteKind::List))
}

async fn create_dataset(
    State(state): State<AppState>,
    session: SessionContext,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    authorized(&session)?;
    let input: DatasetInput = parse(body)?;
    let created = state.api.create_dataset(&session, &input).await.map_err(fail(RouteKind::Mutation))?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_dataset(State(state): State<AppState>, session: SessionContext, Path(id): Path<u64>) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    state.api.get_dataset(&session, id).await.map(Json).map_err(fail(RouteKind::Item))
}

async fn update_dataset(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<u64>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    let patch: DatasetPatch = parse(body)?;
    state.api.update_dataset(&session, id, &patch).await.map(Json).map_err(fail(RouteKind::Mutation))
}

async fn delete_dataset(State(state): State<AppState>, session: SessionContext, Path(id): Path<u64>) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    state.api.delete_dataset(&session, id).await.map_err(fail(RouteKind::Mutation))?;
    Ok(success())
}

// --- documents ----------------------------------------------------------

async fn documents_by_dataset(
    State(state): State<AppState>,
    session: SessionContext,
    Path(dataset_id): Path<u64>,
) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    state.api.documents_by_dataset(&session, dataset_id).await.map(Json).map_err(fail(RouteKind::List))
}

async fn create_text_document(
    State(state): State<AppState>,
    session: SessionContext,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    authorized(&session)?;
    let input: TextDocumentInput = parse(body)?;
    let created = state.api.create_text_document(&session, &input).await.map_err(fail(RouteKind::Mutation))?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn create_file_document(
    State(state): State<AppState>,
    session: SessionContext,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Value>)> {
    authorized(&session)?;
    let bad = |e: axum::extract::multipart::MultipartError| ApiError::bad_request(e.body_text());

    let mut dataset_id = None;
    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        match field.name().map(str::to_string).as_deref() {
            Some("dataset_id") => dataset_id = field.text().await.map_err(bad)?.trim().parse::<u64>().ok(),
            Some("file") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(bad)?.to_vec();
                file = Some((file_name, content_type, bytes));
            }
            _ => {}
        }
    }
    let (Some(dataset_id), Some((file_name, content_type, bytes))) = (dataset_id, file) else {
        return Err(ApiError::bad_request("dataset_id and file are required"));
    };

    let upload = FileUpload { dataset_id, file_name, content_type, bytes };
    let created = state.api.create_file_document(&session, upload).await.map_err(fail(RouteKind::Mutation))?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Deserialize)]
struct DeleteDocumentQuery {
    dataset_id: Option<u64>,
}

async fn delete_document(
    State(state): State<AppState>,
    session: SessionContext,
    Path(id): Path<String>,
    Query(q): Query<DeleteDocumentQuery>,
) -> ApiResult<Json<Value>> {
    authorized(&session)?;
    state.api.delete_document(&session, &id, q.dataset_id).await.map_err(fail(RouteKind::Mutation))?;
    Ok(success())
}

// --- pages and ops ------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RevisionQuery {
    path: String,
}

#[derive(Debug, Serialize)]
struct RevisionResponse {
    path: String,
    revision: u64,
}

async fn revision(State(state): State<AppState>, Query(q): Query<RevisionQuery>) -> Json<RevisionResponse> {
    let revision = match &state.cache {
        Some(cache) => cache.revision(&q.path).await,
        None => 0,
    };
    Json(RevisionResponse { path: q.path, revision })
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/signup", post(signup))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/assistants", get(list_assistants).post(create_assistant))
        .route("/api/assistants/:id", get(get_assistant).put(update_assistant).delete(delete_assistant))
        .route("/api/assistants/:id/chat", post(send_chat))
        .route("/api/assistants/:id/chat-messages", get(chat_messages))
        .route("/api/assistants/:id/datasets", get(assistant_datasets).put(set_assistant_datasets))
        .route("/api/datasets", get(list_datasets).post(create_dataset))
        .route("/api/datasets/:id", get(get_dataset).put(update_dataset).delete(delete_dataset))
        .route("/api/documents/text", post(create_text_document))
        .route("/api/documents/file", post(create_file_document))
        .route("/api/documents/by-dataset/:id", get(documents_by_dataset))
        .route("/api/documents/:id", axum::routing::delete(delete_document))
        .route("/api/revisions", get(revision))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeTransport;
    use crate::gateway::{FormPart, Payload};
    use crate::invalidation::InvalidationCoordinator;
    use crate::settings::Environment;
    use reqwest::header::{COOKIE, SET_COOKIE};
    use reqwest::Method;
    use std::sync::Arc;

    struct Harness {
        base: String,
        client: reqwest::Client,
        transport: Arc<FakeTransport>,
        cache: ResponseCache,
    }

    impl Harness {
        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }

        fn authed(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
            self.client.request(method, self.url(path)).header(COOKIE, "theme=dark; access_token=tok")
        }
    }

    async fn spawn(env: Environment) -> Harness {
        let transport = Arc::new(FakeTransport::new());
        let cache = ResponseCache::new();
        let coordinator = InvalidationCoordinator::new().with_sink(Arc::new(cache.clone()));
        let state = AppState {
            api: BackendApi::new(transport.clone(), coordinator),
            cookies: CookiePolicy::for_environment(env),
            cache: Some(cache.clone()),
            metrics: None,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        Harness { base: format!("http://{addr}"), client: reqwest::Client::new(), transport, cache }
    }

    fn set_cookies(resp: &reqwest::Response) -> Vec<String> {
        resp.headers().get_all(SET_COOKIE).iter().map(|v| v.to_str().unwrap().to_string()).collect()
    }

    #[tokio::test]
    async fn login_sets_both_session_cookies() {
        let h = spawn(Environment::Production).await;
        h.transport.answer(Method::POST, "/auth/sign-in", Ok(json!({"access_token": "A", "refresh_token": "R"})));

        let resp = h
            .client
            .post(h.url("/api/auth/login"))
            .json(&json!({"email": "a@b.c", "password": "pw"}))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        let cookies = set_cookies(&resp);
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with("access_token=A;"));
        assert!(cookies[0].contains("Max-Age=3600"));
        assert!(cookies[0].contains("SameSite=Strict") && cookies[0].ends_with("; Secure"));
        assert!(cookies[1].starts_with("refresh_token=R;"));
        assert!(cookies[1].contains("Max-Age=604800"));
        assert_eq!(resp.json::<Value>().await.unwrap(), json!({"success": true}));
    }

    #[tokio::test]
    async fn login_failures_map_to_their_statuses() {
        let h = spawn(Environment::Development).await;

        let missing = h.client.post(h.url("/api/auth/login")).json(&json!({"email": "a@b.c"})).send().await.unwrap();
        assert_eq!(missing.status(), 400);
        assert_eq!(h.transport.call_count(), 0);

        h.transport.answer(Method::POST, "/auth/sign-in", Ok(json!({"user": {}})));
        let tokenless = h
            .client
            .post(h.url("/api/auth/login"))
            .json(&json!({"email": "a@b.c", "password": "pw"}))
            .send()
            .await
            .unwrap();
        assert_eq!(tokenless.status(), 500);
        assert!(set_cookies(&tokenless).is_empty());

        h.transport.answer(Method::POST, "/auth/sign-up", Err(GatewayError::Upstream { status: 409, message: "taken".into() }));
        let rejected = h
            .client
            .post(h.url("/api/auth/signup"))
            .json(&json!({"email": "a@b.c", "password": "pw"}))
            .send()
            .await
            .unwrap();
        assert_eq!(rejected.status(), 401);
        assert_eq!(rejected.json::<Value>().await.unwrap(), json!({"error": "taken"}));
    }

    #[tokio::test]
    async fn logout_expires_both_cookies() {
        let h = spawn(Environment::Development).await;
        let resp = h.client.post(h.url("/api/auth/logout")).send().await.unwrap();
        let cookies = set_cookies(&resp);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|c| c.contains("Max-Age=0") && c.contains("SameSite=Lax")));
    }

    #[tokio::test]
    async fn anonymous_requests_are_unauthorized_everywhere() {
        let h = spawn(Environment::Development).await;
        for (method, path) in [
            (Method::GET, "/api/assistants"),
            (Method::DELETE, "/api/datasets/3"),
            (Method::GET, "/api/auth/me"),
            (Method::POST, "/api/assistants/1/chat"),
        ] {
            let resp = h.client.request(method, h.url(path)).json(&json!({})).send().await.unwrap();
            assert_eq!(resp.status(), 401, "{path}");
            assert_eq!(resp.json::<Value>().await.unwrap(), json!({"error": "Unauthorized"}));
        }
        assert_eq!(h.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn assistant_routes_forward_the_cookie_token() {
        let h = spawn(Environment::Development).await;
        h.transport.answer(Method::POST, "/assistant", Ok(json!({"id": 9, "name": "Helper"})));
        h.transport.answer(Method::GET, "/assistant/9", Err(GatewayError::Upstream { status: 500, message: "boom".into() }));

        let created = h
            .authed(Method::POST, "/api/assistants")
            .json(&json!({"name": "Helper", "model": "gpt-4o", "temperature": 0.3}))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), 201);
        assert_eq!(h.transport.calls_to("/assistant")[0].token.as_deref(), Some("tok"));

        let missing_fields = h.authed(Method::POST, "/api/assistants").json(&json!({"name": "x"})).send().await.unwrap();
        assert_eq!(missing_fields.status(), 400);

        let item = h.authed(Method::GET, "/api/assistants/9").send().await.unwrap();
        assert_eq!(item.status(), 404);
        assert_eq!(item.json::<Value>().await.unwrap(), json!({"error": "boom"}));

        let deleted = h.authed(Method::DELETE, "/api/assistants/9").send().await.unwrap();
        assert_eq!(deleted.json::<Value>().await.unwrap(), json!({"success": true}));
    }

    #[tokio::test]
    async fn list_failure_is_500_and_chat_history_is_normalized() {
        let h = spawn(Environment::Development).await;
        h.transport.answer(Method::GET, "/datasets/", Err(GatewayError::Network("refused".into())));
        h.transport.answer(
            Method::GET,
            "/assistant/4/chat-messages",
            Ok(json!([{"message_id": 1, "message_type": "user", "text": "hey", "created_at": "2024-01-01T00:00:00Z"}])),
        );

        assert_eq!(h.authed(Method::GET, "/api/datasets").send().await.unwrap().status(), 500);

        let history: Value = h.authed(Method::GET, "/api/assistants/4/chat-messages").send().await.unwrap().json().await.unwrap();
        assert_eq!(history[0]["id"], "1");
        assert_eq!(history[0]["role"], "user");
        assert_eq!(history[0]["content"], "hey");
    }

    #[tokio::test]
    async fn assistant_dataset_links_round_trip() {
        let h = spawn(Environment::Development).await;
        h.transport.answer(Method::GET, "/assistant/get-datasets/2", Ok(json!({"current": [4, "5"]})));

        let ids: Vec<u64> = h.authed(Method::GET, "/api/assistants/2/datasets").send().await.unwrap().json().await.unwrap();
        assert_eq!(ids, vec![4, 5]);

        let resp = h.authed(Method::PUT, "/api/assistants/2/datasets").json(&json!({"datasetIds": [4]})).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(h.transport.calls_to("/assistant/2/datasets")[0].payload, Payload::Json(json!({"dataset_ids": [4]})));
    }

    #[tokio::test]
    async fn file_upload_is_forwarded_as_multipart() {
        let h = spawn(Environment::Development).await;
        let form = reqwest::multipart::Form::new().text("dataset_id", "7").part(
            "file",
            reqwest::multipart::Part::bytes(b"hello".to_vec()).file_name("notes.txt").mime_str("text/plain").unwrap(),
        );
        let resp = h.authed(Method::POST, "/api/documents/file").multipart(form).send().await.unwrap();
        assert_eq!(resp.status(), 201);

        let call = &h.transport.calls_to("/document/file")[0];
        assert_eq!(
            call.payload,
            Payload::Multipart(vec![
                FormPart::Text { name: "dataset_id".into(), value: "7".into() },
                FormPart::File {
                    name: "file".into(),
                    file_name: "notes.txt".into(),
                    content_type: Some("text/plain".into()),
                    bytes: b"hello".to_vec(),
                },
            ])
        );

        let no_file = reqwest::multipart::Form::new().text("dataset_id", "7");
        let resp = h.authed(Method::POST, "/api/documents/file").multipart(no_file).send().await.unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn deleting_a_document_bumps_the_dataset_page_revision() {
        let h = spawn(Environment::Development).await;
        let before: Value = h.client.get(h.url("/api/revisions?path=/datasets/7")).send().await.unwrap().json().await.unwrap();
        assert_eq!(before["revision"], 0);

        let resp = h.authed(Method::DELETE, "/api/documents/doc-1?dataset_id=7").send().await.unwrap();
        assert_eq!(resp.json::<Value>().await.unwrap(), json!({"success": true}));
        assert_eq!(h.transport.calls_to("/document/doc-1").len(), 1);
        assert_eq!(h.cache.revision("/datasets/7").await, 1);

        let after: Value = h.client.get(h.url("/api/revisions?path=/datasets/7")).send().await.unwrap().json().await.unwrap();
        assert_eq!(after, json!({"path": "/datasets/7", "revision": 1}));
    }

    #[tokio::test]
    async fn metrics_route_is_absent_when_disabled() {
        let h = spawn(Environment::Development).await;
        assert_eq!(h.client.get(h.url("/metrics")).send().await.unwrap().status(), 404);
    }
}
