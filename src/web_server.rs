use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, Request, State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::{delete, get, post, put},
    serve, Json, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::VecDeque, convert::Infallible, future::Future, net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::chat::{ChatSession, ClientEvent, ServerEvent};
use crate::data_layer::{Feedback, ThreadWithSteps};
use crate::error::{BuddyError, Result as BuddyResult};
use crate::services::Services;
use crate::store::{PaginatedResponse, Pagination, Thread, ThreadFilter};

#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    services: Arc<Services>,
}

fn create_minijinja_env(templates_dir: std::path::PathBuf) -> AutoReloader {
    AutoReloader::new(move |notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader(&templates_dir));
        notifier.watch_path(&templates_dir, true);
        Ok(env)
    })
}

async fn index_handler(
    State(state): State<AppState>,
) -> Result<Html<String>, (StatusCode, Html<String>)> {
    let app = &state.services.app;
    // Render the chat page from the (auto-reloaded) template
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                tmpl.render(minijinja::context! {
                    title => app.name,
                    chatbot_name => app.name,
                    welcome_message => app.welcome_message,
                    language => app.language,
                    languages => app.languages,
                })
            })
        })
        .map(Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!("Internal Server Error: {}", e)),
            )
        })
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "chatbot": state.services.app.name }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn is_stop(frame: &Message) -> bool {
    match frame {
        Message::Text(text) => matches!(
            serde_json::from_str::<ClientEvent>(text),
            Ok(ClientEvent::Stop)
        ),
        _ => false,
    }
}

/// Drives one chat connection.
///
/// Events run one at a time. While an event is in flight the socket is still
/// read: a `stop` frame cancels the running event, anything else is queued.
async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("New WebSocket connection established");
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Writer task: forward session events to the socket as JSON text frames
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json_msg) => {
                    if sender.send(Message::Text(json_msg)).await.is_err() {
                        warn!("WebSocket client disconnected or send error. Closing writer.");
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize chat event: {}", e),
            }
        }
    });

    let mut session = ChatSession::new(state.services.clone(), tx);
    session.start().await;

    // Frames that arrived while an event was in flight
    let mut backlog: VecDeque<Message> = VecDeque::new();
    let mut closed = false;
    while !closed {
        let frame = match backlog.pop_front() {
            Some(frame) => frame,
            None => match receiver.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
                None => break,
            },
        };

        let event = match frame {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Ignoring malformed client frame: {}", e);
                    session.report_error(format!("Invalid event: {}", e));
                    continue;
                }
            },
            // Audio chunks bypass the event queue
            Message::Binary(chunk) => {
                session.on_audio_chunk(&chunk);
                continue;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                info!("Client requested WebSocket close");
                break;
            }
        };

        // Run the event, still reading the socket so `stop` can cancel it
        let stopped = {
            let work = session.handle(event);
            tokio::pin!(work);
            loop {
                tokio::select! {
                    _ = &mut work => break false,
                    next = receiver.next() => match next {
                        Some(Ok(frame)) if is_stop(&frame) => break true,
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            closed = true;
                            break false;
                        }
                        Some(Ok(frame)) => backlog.push_back(frame),
                    },
                }
            }
        };
        if stopped {
            session.on_stop().await;
        }
    }

    // Clean up the thread, then let the writer drain and exit
    session.end().await;
    drop(session);
    if let Err(e) = writer.await {
        error!("WebSocket writer task failed: {}", e);
    }
    info!("WebSocket connection closed");
}

#[derive(Deserialize, Debug, Default)]
struct ThreadQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    user_id: Option<String>,
    tag: Option<String>,
}

async fn list_threads(
    State(state): State<AppState>,
    Query(query): Query<ThreadQuery>,
) -> BuddyResult<Json<PaginatedResponse<Thread>>> {
    // Missing paging parameters fall back to the first page
    let defaults = Pagination::default();
    let pagination = Pagination {
        page: query.page.unwrap_or(defaults.page),
        page_size: query.page_size.unwrap_or(defaults.page_size),
    };
    let filter = ThreadFilter {
        user_id: query.user_id,
        tag: query.tag,
    };
    let threads = state.services.data_layer.list_threads(pagination, &filter).await?;
    Ok(Json(threads))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> BuddyResult<Json<ThreadWithSteps>> {
    Ok(Json(state.services.data_layer.get_thread_with_steps(&thread_id).await?))
}

async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> BuddyResult<StatusCode> {
    state.services.data_layer.delete_thread(&thread_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_step(
    State(state): State<AppState>,
    Path(step_id): Path<String>,
) -> BuddyResult<StatusCode> {
    state.services.data_layer.delete_step(&step_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn thread_author(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> BuddyResult<Json<Value>> {
    let author = state.services.data_layer.get_thread_author(&thread_id).await?;
    Ok(Json(json!({ "author": author })))
}

async fn upsert_feedback(
    State(state): State<AppState>,
    Json(feedback): Json<Feedback>,
) -> BuddyResult<Json<Value>> {
    let message_id = state.services.data_layer.upsert_feedback(&feedback).await?;
    Ok(Json(json!({ "message_id": message_id })))
}

async fn delete_feedback(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> BuddyResult<Json<Value>> {
    let deleted = state.services.data_layer.delete_feedback(&message_id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

/// Either `text` or a `json` document whose string leaves get translated.
#[derive(Deserialize, Debug)]
struct TranslateRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    json: Option<Value>,
    to: Vec<String>,
    /// Defaults to the chatbot's base language
    #[serde(default)]
    from: Option<String>,
}

async fn translate(
    State(state): State<AppState>,
    Json(request): Json<TranslateRequest>,
) -> BuddyResult<Json<Value>> {
    let translator = state
        .services
        .translator
        .as_ref()
        .ok_or(BuddyError::Disabled("translator"))?;
    let source = request
        .from
        .unwrap_or_else(|| state.services.app.language.clone());

    match (request.text, request.json) {
        (Some(text), None) => {
            let translations = translator.translate(&text, &request.to, &source).await?;
            Ok(Json(json!({ "translations": translations })))
        }
        (None, Some(document)) => {
            if request.to.is_empty() {
                return Err(BuddyError::Validation(
                    "at least one target language is required".to_string(),
                ));
            }
            // One pass over the document per target language
            let mut translations = Vec::with_capacity(request.to.len());
            for target in &request.to {
                let translated = translator.translate_json(&document, target, &source).await?;
                translations.push(json!({ "to": target, "json": translated }));
            }
            Ok(Json(json!({ "translations": translations })))
        }
        _ => Err(BuddyError::Validation(
            "exactly one of text or json is required".to_string(),
        )),
    }
}

#[derive(Deserialize, Debug)]
struct TtsRequest {
    text: String,
}

async fn text_to_speech(
    State(state): State<AppState>,
    Json(request): Json<TtsRequest>,
) -> BuddyResult<impl IntoResponse> {
    let tts = state
        .services
        .tts
        .as_ref()
        .ok_or(BuddyError::Disabled("text to speech"))?;
    let audio = tts.synthesize(&request.text).await?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], audio))
}

/// Builds the chat UI, socket and REST routes. `assets_dir` holds `templates/` and `static/`.
pub fn router(services: Arc<Services>, assets_dir: &std::path::Path) -> Router {
    let state = AppState {
        templates: Arc::new(create_minijinja_env(assets_dir.join("templates"))),
        services,
    };

    // Serve static files from the "static" directory, 404 for anything missing
    let static_files_service = ServeDir::new(assets_dir.join("static")).not_found_service(
        tower::service_fn(|_req: Request| async {
            Ok::<_, Infallible>((StatusCode::NOT_FOUND, "Not Found").into_response())
        }),
    );

    // Define routes
    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/threads", get(list_threads))
        .route("/api/threads/:id", get(get_thread).delete(delete_thread))
        .route("/api/threads/:id/author", get(thread_author))
        .route("/api/steps/:id", delete(delete_step))
        .route("/api/feedback", put(upsert_feedback))
        .route("/api/feedback/:id", delete(delete_feedback))
        .route("/api/translate", post(translate))
        .route("/api/tts", post(text_to_speech))
        .nest_service("/static", static_files_service)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Binds the listening socket; port 0 picks a free port.
pub async fn bind_listener(host: &str, port: u16) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind to address {}:{}", host, port))
}

/// Serves the chat app on an already bound listener until `shutdown` resolves.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    services: Arc<Services>,
    assets_dir: &std::path::Path,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(services, assets_dir);
    let addr: SocketAddr = listener.local_addr().context("Listener has no local address")?;
    info!("Web server listening on http://{}", addr);

    serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("Web server failed")?;

    info!("Web server stopped");
    Ok(())
}

/// Serves the chat app on `host:port` until `shutdown` resolves.
pub async fn start_web_server(
    host: &str,
    port: u16,
    services: Arc<Services>,
    assets_dir: &std::path::Path,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = bind_listener(host, port).await?;
    serve_on(listener, services, assets_dir, shutdown).await
}
