use argh::FromArgs;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::Html,
    routing::{get, post, put},
};
use lru::LruCache;
use serde_json::json;
use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use vision_chat::{
    AskEngine, AskEngineResult, ChatConfig, ChatError, ImageKind, ModelDirectory, ModelMatch,
    OllamaClient, QueryDispatcher, SessionController, SessionState, UploadedImage,
    config::DEFAULT_SERVER_URL,
};

mod messages;

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_SESSIONS: usize = 256;

// seven full-size photos fit comfortably
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

const PAGE: &str = include_str!("page.html");

#[derive(FromArgs)]
/// Chat with a local multimodal model about uploaded images.
struct ServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// base url of the inference server
    #[argh(option, default = "DEFAULT_SERVER_URL.to_string()")]
    ollama: String,

    /// request timeout in seconds
    #[argh(option, default = "DEFAULT_TIMEOUT_SECS")]
    timeout: u64,

    /// only accept model names that exactly match the server listing
    #[argh(switch)]
    exact: bool,

    /// number of answers to cache, 0 disables the cache
    #[argh(option, default = "0")]
    cache: usize,

    /// sessions kept in memory, the least recently used one is dropped first
    #[argh(option, default = "DEFAULT_MAX_SESSIONS")]
    max_sessions: usize,
}

type Dispatcher = Arc<dyn QueryDispatcher + Send + Sync>;
type Reply = (StatusCode, Json<serde_json::Value>);

struct SessionSlot {
    state: SessionState,
    error: Option<String>,
    /// Answers this session's questions. Taken out when the session closes.
    engine: Option<AskEngine<u64>>,
}

impl SessionSlot {
    /// Moves every finished answer from the engine into the transcript.
    fn drain_responses(&mut self, controller: &SessionController<Dispatcher, OllamaClient>) {
        let Some(engine) = &self.engine else {
            return;
        };
        loop {
            match engine.try_poll_response() {
                AskEngineResult::Success(response) => {
                    log::info!(
                        "Question {} of session {} answered in {:?}",
                        response.id,
                        response.session,
                        response.duration
                    );
                    self.error = controller
                        .finish_question(&mut self.state, response.result)
                        .err()
                        .map(|e| e.to_string());
                }
                AskEngineResult::Empty(_) => break,
                AskEngineResult::Error(e) => {
                    log::error!("Engine failure: {}", e);
                    break;
                }
            }
        }
    }
}

struct AppState {
    controller: SessionController<Dispatcher, OllamaClient>,
    sessions: Mutex<LruCache<u64, Arc<Mutex<SessionSlot>>>>,
    next_session: AtomicU64,
}

impl AppState {
    fn session(&self, id: u64) -> Result<Arc<Mutex<SessionSlot>>, Reply> {
        lock(&self.sessions).get(&id).cloned().ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("unknown session {}", id) })),
            )
        })
    }

    fn view(&self, id: u64, slot: &SessionSlot) -> Json<messages::SessionView> {
        Json(messages::SessionView::new(id, &slot.state, slot.error.clone()))
    }

    /// Stops a session's engine off the event loop, since stopping waits for
    /// the question in flight.
    fn retire(id: u64, slot: Arc<Mutex<SessionSlot>>) {
        log::info!("Closing session {}", id);
        tokio::task::spawn_blocking(move || {
            let engine = lock(&slot).engine.take();
            drop(engine);
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn error_reply(error: &ChatError) -> Reply {
    let status = match error {
        ChatError::ServerUnavailable(_) | ChatError::Inference(_) => StatusCode::BAD_GATEWAY,
        ChatError::ModelNotAvailable(_) => StatusCode::NOT_FOUND,
        ChatError::Busy => StatusCode::CONFLICT,
        ChatError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({ "error": error.to_string() })))
}

/// Runs a call that talks to the inference server, or chews on images, off
/// the event loop.
async fn run_blocking<T, F>(f: F) -> Result<T, Reply>
where
    T: Send + 'static,
    F: FnOnce() -> vision_chat::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            log::warn!("Request failed: {}", e);
            Err(error_reply(&e))
        }
        Err(e) => {
            log::error!("Blocking task failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            ))
        }
    }
}

async fn get_models(
    State(app): State<Arc<AppState>>,
) -> Result<Json<messages::ModelList>, Reply> {
    let models = run_blocking(move || app.controller.directory().list_models()).await?;
    Ok(Json(messages::ModelList { models }))
}

async fn create_session(
    State(app): State<Arc<AppState>>,
) -> Result<Json<messages::SessionView>, Reply> {
    let state = run_blocking({
        let app = app.clone();
        move || {
            let mut state = SessionState::new();
            // preselect the first listed model
            if let Some(first) = app.controller.directory().list_models()?.into_iter().next() {
                app.controller.set_model(&mut state, first)?;
            }
            Ok(state)
        }
    })
    .await?;

    let id = app.next_session.fetch_add(1, Ordering::Relaxed);
    let slot = SessionSlot {
        state,
        error: None,
        engine: Some(AskEngine::new(app.controller.dispatcher().clone())),
    };
    let view = app.view(id, &slot);
    let evicted = lock(&app.sessions).push(id, Arc::new(Mutex::new(slot)));
    if let Some((old_id, old_slot)) = evicted {
        AppState::retire(old_id, old_slot);
    }

    log::info!("Created session {}", id);
    Ok(view)
}

async fn get_session(
    State(app): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<messages::SessionView>, Reply> {
    let slot = app.session(id)?;
    let mut slot = lock(&slot);
    slot.drain_responses(&app.controller);
    Ok(app.view(id, &slot))
}

async fn delete_session(
    State(app): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<StatusCode, Reply> {
    let slot = lock(&app.sessions).pop(&id);
    match slot {
        Some(slot) => {
            AppState::retire(id, slot);
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown session {}", id) })),
        )),
    }
}

async fn put_model(
    State(app): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(payload): Json<messages::ModelSelection>,
) -> Result<Json<messages::SessionView>, Reply> {
    let slot = app.session(id)?;
    run_blocking({
        let app = app.clone();
        move || {
            let mut slot = lock(&slot);
            app.controller.set_model(&mut slot.state, payload.model)?;
            slot.error = None;
            Ok(app.view(id, &slot))
        }
    })
    .await
}

async fn post_images(
    State(app): State<Arc<AppState>>,
    Path(id): Path<u64>,
    mut multipart: Multipart,
) -> Result<Json<messages::ImagesUploaded>, Reply> {
    let slot = app.session(id)?;

    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
    })? {
        let name = field.file_name().unwrap_or_default().to_string();
        let kind = field.content_type().and_then(ImageKind::from_mime).or_else(|| {
            name.rsplit_once('.')
                .and_then(|(_, extension)| ImageKind::from_extension(extension))
        });
        let bytes = field.bytes().await.map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
        })?;
        files.push(UploadedImage::new(name, kind, bytes.to_vec()));
    }

    log::debug!("Session {} uploaded {} file(s)", id, files.len());

    run_blocking(move || {
        let mut slot = lock(&slot);
        let count = app.controller.set_images(&mut slot.state, &files)?;
        slot.error = None;
        Ok(Json(messages::ImagesUploaded {
            count,
            images: slot.state.images().iter().map(|image| image.to_data_url()).collect(),
        }))
    })
    .await
}

async fn post_question(
    State(app): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(payload): Json<messages::QuestionRequest>,
) -> Result<(StatusCode, Json<messages::SessionView>), Reply> {
    let slot = app.session(id)?;
    let mut slot = lock(&slot);
    slot.drain_responses(&app.controller);
    let SessionSlot {
        state,
        error,
        engine,
    } = &mut *slot;

    let request = app
        .controller
        .begin_question(state, &payload.question)
        .map_err(|e| error_reply(&e))?;
    *error = None;

    // schedule the question
    let scheduled = match engine {
        Some(engine) => engine.schedule(id, request),
        None => Err(ChatError::Inference("session is closed".to_string())),
    };
    if let Err(e) = scheduled {
        let _ = app.controller.finish_question(state, Err(e));
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "question could not be scheduled" })),
        ));
    }

    log::info!("Scheduled question for session {}", id);

    Ok((StatusCode::ACCEPTED, app.view(id, &slot)))
}

async fn serve(app: Arc<AppState>, addr: String) -> std::io::Result<()> {
    let router = Router::new()
        .route("/", get(|| async { Html(PAGE) }))
        .route("/api/models", get(get_models))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/model", put(put_model))
        .route("/api/sessions/{id}/images", post(post_images))
        .route("/api/sessions/{id}/questions", post(post_question))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(app);

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

// The blocking http client must be created and dropped outside the async
// runtime, so the runtime is built by hand.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: ServerArgs = argh::from_env();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let config = ChatConfig::default()
        .with_server_url(args.ollama)
        .with_request_timeout(Duration::from_secs(args.timeout))
        .with_model_match(if args.exact {
            ModelMatch::Exact
        } else {
            ModelMatch::Substring
        })
        .with_cache_capacity(args.cache);

    let directory = OllamaClient::new(&config)?;
    let dispatcher: Dispatcher = Arc::from(vision_chat::dispatcher_from_config(&config)?);
    let max_sessions =
        NonZeroUsize::new(args.max_sessions).ok_or("--max-sessions must be at least 1")?;

    let app = Arc::new(AppState {
        controller: SessionController::new(dispatcher, directory)
            .with_max_images(config.max_images),
        sessions: Mutex::new(LruCache::new(max_sessions)),
        next_session: AtomicU64::new(1),
    });

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(app.clone(), addr))?;

    Ok(())
}
