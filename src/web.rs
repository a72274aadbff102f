use crate::error::{RenderError, ResourceError, SourceError};
use crate::history::HistoryLog;
use crate::link::RedirectInstruction;
use crate::merge::{Rendered, RenderedPage, RenderedSection, Renderer};
use crate::resource::{DEFAULT_CACHE_CAPACITY, ResourceService, builtin_asset};
use crate::source::SourceRegistry;
use askama::Template;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use percent_encoding::{AsciiSet, CONTROLS, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn};

type SharedState = Arc<AppState>;
const SUGGESTION_LIMIT: usize = 20;
const HISTORY_DISPLAY: usize = 50;

/// Characters escaped in a `Location` fragment.
const FRAGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'%');

pub struct AppState {
    pub renderer: Renderer,
    pub resources: ResourceService,
    pub history: HistoryLog,
}

impl AppState {
    pub fn new(
        registry: SourceRegistry,
        base_url: impl Into<String>,
        history: HistoryLog,
        cache_capacity: Option<usize>,
    ) -> Self {
        let registry = Arc::new(registry);
        Self {
            renderer: Renderer::new(Arc::clone(&registry), base_url),
            resources: ResourceService::new(registry, cache_capacity),
            history,
        }
    }

    fn remember(&self, page: &RenderedPage) {
        if !page.found {
            return;
        }
        if let Err(err) = self.history.record(&page.word) {
            warn!(word = %page.word, error = %err, "failed to record history");
        }
    }
}

#[derive(Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    pub base_url: String,
    pub dictionaries: Vec<PathBuf>,
    pub history_path: Option<PathBuf>,
    /// `None` disables the resource cache.
    pub cache_capacity: Option<usize>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            base_url: "http://127.0.0.1:8080".to_string(),
            dictionaries: Vec::new(),
            history_path: None,
            cache_capacity: Some(DEFAULT_CACHE_CAPACITY),
        }
    }
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to load dictionaries: {0}")]
    Source(#[from] SourceError),
}

pub async fn serve(config: WebConfig) -> Result<(), WebError> {
    let registry = SourceRegistry::from_dirs(&config.dictionaries)?;
    let history = match &config.history_path {
        Some(path) => HistoryLog::persistent(path),
        None => HistoryLog::ephemeral(),
    };
    let dictionaries = registry.len();
    let state = Arc::new(AppState::new(
        registry,
        config.base_url.clone(),
        history,
        config.cache_capacity,
    ));
    let router = build_router(state);
    info!(
        %config.addr,
        base = %config.base_url,
        dictionaries,
        cache = ?config.cache_capacity,
        "Binding HTTP listener"
    );
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server exited");
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<RenderError> for ApiError {
    fn from(err: RenderError) -> Self {
        let status = match err {
            RenderError::SourceNotFound(_) => StatusCode::NOT_FOUND,
            RenderError::RedirectCycle { .. } => StatusCode::LOOP_DETECTED,
            RenderError::EmptyWord => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<ResourceError> for ApiError {
    fn from(err: ResourceError) -> Self {
        let status = match err {
            ResourceError::SourceNotFound(_) | ResourceError::NotFound(_) => StatusCode::NOT_FOUND,
            ResourceError::Stylesheet { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({ "error": self.message });
        (self.status, Json(payload)).into_response()
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/healthz", get(health))
        .route("/search/:part", get(suggest))
        .route("/list/", get(list))
        .route("/clear_history/", get(clear_history))
        .route("/export_history/", get(export_history))
        .route("/static/*path", get(static_asset))
        .route("/:id/query/:word", get(query_word))
        .route("/:id/resource/*path", get(resource))
        .route("/:id/lite/", get(lite))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CompressionLayer::new())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[derive(Debug, Deserialize)]
struct WordParams {
    word: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LiteParams {
    word: Option<String>,
    fallback: Option<String>,
    all_result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    uuid: Option<String>,
}

async fn home(
    State(state): State<SharedState>,
    Query(params): Query<WordParams>,
) -> Result<Html<String>, ApiError> {
    let word = params.word.unwrap_or_default();
    if word.trim().is_empty() {
        let history = state.history.read().unwrap_or_else(|err| {
            warn!(error = %err, "failed to read history");
            Vec::new()
        });
        return render_home(&history);
    }
    let page = state.renderer.render_aggregate(&word)?;
    state.remember(&page);
    render_page(&page)
}

async fn query_word(
    State(state): State<SharedState>,
    Path((id, word)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if id == "default" {
        let first = state
            .renderer
            .registry()
            .first()
            .ok_or_else(|| ApiError::not_found("no dictionaries are installed"))?;
        return Ok(Redirect::to(&query_url(&first.id, word.trim(), None)).into_response());
    }
    match state.renderer.render_single(&id, &word)? {
        Rendered::Redirect(target) => Ok(Redirect::to(&redirect_url(&target, false)).into_response()),
        Rendered::Page(page) => {
            state.remember(&page);
            Ok(render_page(&page)?.into_response())
        }
    }
}

async fn lite(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(params): Query<LiteParams>,
) -> Result<Response, ApiError> {
    let word = params.word.unwrap_or_default();
    let fallback: Vec<String> = params
        .fallback
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    let all_results = params.all_result.as_deref() == Some("true");
    let response = match state
        .renderer
        .render_lite(&id, &word, &fallback, all_results)?
    {
        Rendered::Redirect(target) => Redirect::to(&redirect_url(&target, true)).into_response(),
        Rendered::Page(page) => {
            state.remember(&page);
            Html(page.lite_html()).into_response()
        }
    };
    Ok(with_cors(response))
}

async fn resource(
    State(state): State<SharedState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let content_type = content_type(&path);
    let data = tokio::task::spawn_blocking(move || state.resources.fetch(&id, &path))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))??;
    let response = (
        [(header::CONTENT_TYPE, content_type.to_string())],
        data.to_vec(),
    )
        .into_response();
    Ok(with_cors(response))
}

async fn static_asset(Path(path): Path<String>) -> Result<Response, ApiError> {
    let data = builtin_asset(&path).ok_or_else(|| ApiError::not_found(format!("{path} not found")))?;
    Ok((
        [(header::CONTENT_TYPE, content_type(&path).to_string())],
        data,
    )
        .into_response())
}

async fn suggest(
    State(state): State<SharedState>,
    Path(part): Path<String>,
) -> impl IntoResponse {
    let suggestion = state.renderer.suggest(&part, SUGGESTION_LIMIT);
    Json(json!({ "suggestion": suggestion }))
}

async fn list(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    Json(state.renderer.list(params.uuid.as_deref()))
}

async fn clear_history(State(state): State<SharedState>) -> Response {
    if let Err(err) = state.history.clear() {
        warn!(error = %err, "failed to clear history");
        return ApiError::internal(err.to_string()).into_response();
    }
    Redirect::to("/").into_response()
}

async fn export_history(State(state): State<SharedState>) -> Response {
    let csv = match state.history.export_csv() {
        Ok(csv) => csv,
        Err(err) => return ApiError::internal(err.to_string()).into_response(),
    };
    let filename = format!("history-{}.csv", chrono::Local::now().format("%Y%m%d"));
    (
        [
            (header::CONTENT_TYPE, mime::TEXT_CSV_UTF_8.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        csv,
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "mdict-render" }))
}

fn with_cors(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    response
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

fn push_anchor(url: &mut String, anchor: Option<&str>) {
    if let Some(anchor) = anchor {
        url.push('#');
        url.extend(utf8_percent_encode(anchor, FRAGMENT));
    }
}

fn query_url(source_id: &str, word: &str, anchor: Option<&str>) -> String {
    let mut url = format!(
        "/{}/query/{}",
        encode_component(source_id),
        encode_component(word)
    );
    push_anchor(&mut url, anchor);
    url
}

fn redirect_url(target: &RedirectInstruction, lite: bool) -> String {
    if !lite {
        return query_url(&target.source_id, &target.target_word, target.anchor.as_deref());
    }
    let mut url = format!(
        "/{}/lite/?word={}",
        encode_component(&target.source_id),
        encode_component(&target.target_word)
    );
    push_anchor(&mut url, target.anchor.as_deref());
    url
}

fn content_type(path: &str) -> mime::Mime {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "css" => mime::TEXT_CSS_UTF_8,
        "js" => mime::APPLICATION_JAVASCRIPT_UTF_8,
        "html" | "htm" => mime::TEXT_HTML_UTF_8,
        "png" => mime::IMAGE_PNG,
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "gif" => mime::IMAGE_GIF,
        "svg" => mime::IMAGE_SVG,
        "bmp" => mime::IMAGE_BMP,
        "woff" => mime::FONT_WOFF,
        "woff2" => mime::FONT_WOFF2,
        "ico" => parse_mime("image/x-icon"),
        "mp3" => parse_mime("audio/mpeg"),
        "spx" | "ogg" => parse_mime("audio/ogg"),
        "wav" => parse_mime("audio/wav"),
        "ttf" => parse_mime("font/ttf"),
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

fn parse_mime(value: &str) -> mime::Mime {
    value.parse().unwrap_or(mime::APPLICATION_OCTET_STREAM)
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <link rel="stylesheet" href="/static/css/mdict.css" />
    <title>MDict</title>
  </head>
  <body>
    <form class="mdict-search" action="/" method="get">
      <input type="search" name="word" value="" autofocus />
      <button type="submit">Search</button>
    </form>
    <section class="mdict-history">
      <h2>History</h2>
      {% if history.len() == 0 %}
      <p>No words looked up yet.</p>
      {% else %}
      <ul>
        {% for link in history %}
        <li><a href="/?word={{ link.query }}">{{ link.word }}</a></li>
        {% endfor %}
      </ul>
      {% endif %}
      <p><a href="/export_history/">Export</a> · <a href="/clear_history/">Clear</a></p>
    </section>
  </body>
</html>"#,
    ext = "html"
)]
struct HomeTemplate<'a> {
    history: Vec<HistoryLink<'a>>,
}

struct HistoryLink<'a> {
    word: &'a str,
    query: String,
}

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <link rel="stylesheet" href="/static/css/mdict.css" />
    <title>{{ word }} · MDict</title>
  </head>
  <body>
    <form class="mdict-search" action="/" method="get">
      <input type="search" name="word" value="{{ word }}" autofocus />
      <button type="submit">Search</button>
    </form>
    {% for section in sections %}
    <section class="mdict-section">
      <header class="mdict-title">
        <img src="{{ section.logo_url }}" alt="" height="16" />
        <span>{{ section.title }}</span>
      </header>
      {% if !section.about_html.is_empty() %}
      <details class="mdict-about">{{ section.about_html|safe }}</details>
      {% endif %}
      <div id="class_{{ section.source_id }}" class="mdict">{{ section.body_html|safe }}</div>
    </section>
    {% endfor %}
    <script src="/static/js/mdict.js"></script>
  </body>
</html>"#,
    ext = "html"
)]
struct QueryTemplate<'a> {
    word: &'a str,
    sections: &'a [RenderedSection],
}

fn render_home(history: &[String]) -> Result<Html<String>, ApiError> {
    let history = history
        .iter()
        .take(HISTORY_DISPLAY)
        .map(|word| HistoryLink {
            word: word.as_str(),
            query: encode_component(word),
        })
        .collect();
    let html = HomeTemplate { history }
        .render()
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Html(html))
}

fn render_page(page: &RenderedPage) -> Result<Html<String>, ApiError> {
    let html = QueryTemplate {
        word: &page.word,
        sections: &page.sections,
    }
    .render()
    .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Html(html))
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use super::*;
    use crate::source::{DictionarySource, SourceKind, StaticDictionary};
    use axum::{body, body::Body, http::Request};
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let records = [
            ("hello", r#"<p>hello</p><img src="hi.png">"#),
            ("colour", "@@@LINK=color"),
            ("went", "@@@LINK=go#past"),
            ("go", "<p>go</p>"),
            ("ping", "@@@LINK=pong"),
            ("pong", "@@@LINK=ping"),
            ("help", "<p>help</p>"),
            ("spaced", "@@@LINK=go#a b"),
        ];
        let lookup = StaticDictionary::from_records(records).unwrap();
        let mut registry = SourceRegistry::new();
        registry.install(DictionarySource::new(
            "oald",
            "Oxford",
            SourceKind::StaticLookup,
            Arc::new(lookup),
        ));
        Arc::new(AppState::new(
            registry,
            "http://127.0.0.1:8080",
            HistoryLog::ephemeral(),
            Some(16),
        ))
    }

    async fn get(state: &SharedState, uri: &str) -> Response {
        build_router(Arc::clone(state))
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn text(response: Response) -> String {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    #[tokio::test]
    async fn aggregate_page_records_history() {
        let state = test_state();
        let response = get(&state, "/?word=hello").await;
        assert!(response.status().is_success());
        let html = text(response).await;
        assert!(html.contains(r#"<div id="class_oald" class="mdict">"#));
        assert!(html.contains(r#"src="oald/resource/hi.png""#));
        assert_eq!(state.history.read().unwrap(), vec!["hello"]);

        let home = text(get(&state, "/").await).await;
        assert!(home.contains(r#"<a href="/?word=hello">hello</a>"#));
    }

    #[tokio::test]
    async fn single_query_redirects_aliases_with_anchor() {
        let state = test_state();
        let response = get(&state, "/oald/query/went").await;
        assert!(response.status().is_redirection());
        assert_eq!(location(&response), "/oald/query/go#past");

        let response = get(&state, "/default/query/hello").await;
        assert_eq!(location(&response), "/oald/query/hello");
    }

    #[tokio::test]
    async fn redirect_anchors_are_percent_encoded() {
        let state = test_state();
        let response = get(&state, "/oald/query/spaced").await;
        assert_eq!(location(&response), "/oald/query/go#a%20b");
        let response = get(&state, "/oald/lite/?word=spaced").await;
        assert_eq!(location(&response), "/oald/lite/?word=go#a%20b");
    }

    #[tokio::test]
    async fn page_shell_escapes_the_query_word() {
        let state = test_state();
        let html = text(get(&state, "/?word=%3Cb%3E").await).await;
        assert!(html.contains("<title>&lt;b&gt; · MDict</title>"));
        assert!(!html.contains("<b>"));
        assert!(state.history.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_query_renders_relative_links() {
        let state = test_state();
        let response = get(&state, "/oald/query/hello").await;
        assert_eq!(response.status(), StatusCode::OK);
        let html = text(response).await;
        assert!(html.contains(r#"src="../resource/hi.png""#));
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let state = test_state();
        assert_eq!(
            get(&state, "/nope/query/hello").await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get(&state, "/oald/query/ping").await.status(),
            StatusCode::LOOP_DETECTED
        );
        assert_eq!(
            get(&state, "/oald/query/%20").await.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            get(&state, "/oald/resource/missing.png").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn lite_fragment_allows_cross_origin_use() {
        let state = test_state();
        let response = get(&state, "/oald/lite/?word=hello").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        let html = text(response).await;
        assert!(html.contains(r#" data-abs-url src="http://127.0.0.1:8080/oald/resource/hi.png""#));

        let response = get(&state, "/oald/lite/?word=went").await;
        assert_eq!(location(&response), "/oald/lite/?word=go#past");
    }

    #[tokio::test]
    async fn suggestions_and_listing_are_json() {
        let state = test_state();
        let payload: serde_json::Value =
            serde_json::from_str(&text(get(&state, "/search/hel").await).await).unwrap();
        assert_eq!(payload["suggestion"], json!(["hello", "help"]));

        let listing: serde_json::Value =
            serde_json::from_str(&text(get(&state, "/list/?uuid=oald").await).await).unwrap();
        assert_eq!(listing[0]["uuid"], "oald");
        assert_eq!(listing[0]["type"], "static_lookup");
        assert_eq!(
            listing[0]["logo"],
            "http://127.0.0.1:8080/oald/resource/logo.ico"
        );
    }

    #[tokio::test]
    async fn builtin_assets_are_served() {
        let state = test_state();
        let response = get(&state, "/static/js/mdict.js").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/javascript; charset=utf-8"
        );
        let response = get(&state, "/oald/resource/logo.ico").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn history_can_be_exported_and_cleared() {
        let state = test_state();
        get(&state, "/?word=hello").await;
        get(&state, "/oald/query/go").await;

        let response = get(&state, "/export_history/").await;
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"history-"));
        let csv = text(response).await;
        let rows: Vec<&str> = csv.lines().collect();
        assert_eq!(rows[0], "word,looked_up_at");
        assert!(rows[1].starts_with("hello,"));
        assert!(rows[2].starts_with("go,"));

        let response = get(&state, "/clear_history/").await;
        assert_eq!(location(&response), "/");
        assert!(state.history.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let state = test_state();
        let payload: serde_json::Value =
            serde_json::from_str(&text(get(&state, "/healthz").await).await).unwrap();
        assert_eq!(payload["status"], "ok");
    }
}
