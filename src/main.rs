mod config;
mod error;
mod models;
mod services;
mod storage;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    response::{Html, Json},
    routing::{get, post},
};
use error::Error;
use models::{BookListing, BookRecord, ChatRequest, ChatResponse, ProcessResult, Summary};
use services::library::LibraryService;
use services::llm::{ImageClient, LLMClient};
use std::sync::Arc;
use storage::DocumentStore;
use storage::gist::GistClient;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{EnvFilter, fmt};

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    library: Arc<LibraryService>,
    llm_client: Arc<LLMClient>,
    image_client: Arc<ImageClient>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = config::Config::from_env()?;

    let store: Arc<dyn DocumentStore> = Arc::new(GistClient::new(&config)?);
    let library = Arc::new(LibraryService::new(
        store,
        config.library_label.clone(),
        config.save_debounce,
    ));
    match library.load().await {
        Ok(books) => tracing::info!(books, "library ready"),
        Err(e) => tracing::warn!("{}; retrying on first request", e),
    }

    let app_state = AppState {
        library: library.clone(),
        llm_client: Arc::new(LLMClient::new(&config)?),
        image_client: Arc::new(ImageClient::new(&config)?),
    };

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Pending debounced changes are written before exit.
    library.flush().await?;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/upload", post(upload_file))
        .route("/books", get(list_books).delete(clear_books))
        .route("/books/:id", get(get_book).put(update_book))
        .route("/books/:id/chapters/:index/summary", post(summarize_chapter))
        .route("/books/:id/chapters/:index/chat", post(chat_about_chapter))
        .route("/books/:id/chapters/:index/image", post(illustrate_chapter))
        .route("/credentials/check", get(check_credentials))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::AllowMethods::any())
                .allow_headers(tower_http::cors::AllowHeaders::any()),
        )
}

async fn index() -> Html<&'static str> {
    Html(
        r#"
    <!DOCTYPE html>
    <html>
    <head>
        <title>Shelfsync</title>
        <meta charset="utf-8">
        <style>
            body { font-family: Arial, sans-serif; margin: 40px; }
            .endpoint { background-color: #f5f5f5; padding: 10px; margin: 10px 0; border-radius: 4px; font-family: monospace; }
        </style>
    </head>
    <body>
        <h1>Shelfsync</h1>
        <p>Upload a plain-text or EPUB book; it is split into chapters and kept in a private gist.</p>

        <h2>Available Endpoints:</h2>
        <div class="endpoint">GET /health</div>
        <div class="endpoint">POST /upload - multipart field 'text_file' (.txt or .epub)</div>
        <div class="endpoint">GET /books - library, most recently read first</div>
        <div class="endpoint">GET /books/:id</div>
        <div class="endpoint">PUT /books/:id - replace a stored book</div>
        <div class="endpoint">DELETE /books - remove every book</div>
        <div class="endpoint">POST /books/:id/chapters/:index/summary</div>
        <div class="endpoint">POST /books/:id/chapters/:index/chat - JSON {"message": "..."}</div>
        <div class="endpoint">POST /books/:id/chapters/:index/image</div>
        <div class="endpoint">GET /credentials/check</div>
    </body>
    </html>
    "#,
    )
}

async fn health_check() -> &'static str {
    "OK"
}

fn book_from_upload(file_name: Option<&str>, bytes: &[u8]) -> Result<BookRecord, Error> {
    if services::epub::looks_like_epub(file_name, bytes) {
        let book = services::epub::parse_epub(bytes)?;
        let title = book
            .title
            .or_else(|| {
                file_name
                    .and_then(|name| std::path::Path::new(name).file_stem())
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "Untitled Book".to_string());
        return Ok(BookRecord::new(title, book.chapters));
    }

    let text = services::chapterizer::decode_text(bytes)?;
    Ok(services::chapterizer::process_text(&text))
}

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, Error> {
    // Extract the uploaded book file
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidUpload(e.to_string()))?
    {
        let name = field.name().unwrap_or("unknown");
        if name == "text_file" || name == "file" {
            let file_name = field.file_name().map(str::to_string);
            let data = field
                .bytes()
                .await
                .map_err(|e| Error::InvalidUpload(e.to_string()))?;

            let draft = book_from_upload(file_name.as_deref(), &data)?;
            if draft.chapters.is_empty() {
                return Err(Error::InvalidUpload(
                    "no chapters were found in the file".to_string(),
                ));
            }

            let title = draft.title.clone();
            let chapter_count = draft.chapter_count();
            let id = state.library.add_book(draft).await?;
            let result = ProcessResult {
                id,
                title,
                chapter_count,
            };

            return Ok(Json(serde_json::json!({
                "success": true,
                "book": result,
            })));
        }
    }

    Err(Error::InvalidUpload(
        "expected a multipart field named 'text_file'".to_string(),
    ))
}

async fn list_books(State(state): State<AppState>) -> Result<Json<Vec<BookListing>>, Error> {
    Ok(Json(state.library.list_books().await?))
}

async fn get_book(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<BookRecord>, Error> {
    Ok(Json(state.library.get_book(id).await?))
}

async fn update_book(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(mut record): Json<BookRecord>,
) -> Result<Json<serde_json::Value>, Error> {
    record.id = Some(id);
    record.cleanup();
    state.library.update_book(record).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn clear_books(State(state): State<AppState>) -> Result<Json<serde_json::Value>, Error> {
    state.library.clear().await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn summarize_chapter(
    State(state): State<AppState>,
    Path((id, index)): Path<(u64, usize)>,
) -> Result<Json<Summary>, Error> {
    let book = state.library.get_book(id).await?;
    let chapter = book
        .chapter(index)
        .ok_or(Error::ChapterNotFound { book_id: id, index })?;

    let summary = state.llm_client.summarize_chapter(chapter).await?;
    state.library.set_summary(id, index, summary.clone()).await?;
    Ok(Json(summary))
}

async fn chat_about_chapter(
    State(state): State<AppState>,
    Path((id, index)): Path<(u64, usize)>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, Error> {
    if request.message.trim().is_empty() {
        return Err(Error::InvalidUpload("message is empty".to_string()));
    }
    let book = state.library.get_book(id).await?;
    let chapter = book
        .chapter(index)
        .ok_or(Error::ChapterNotFound { book_id: id, index })?;

    let reply = state
        .llm_client
        .chat(chapter, book.summaries.get(&index), &request.message)
        .await?;
    Ok(Json(ChatResponse { reply }))
}

async fn illustrate_chapter(
    State(state): State<AppState>,
    Path((id, index)): Path<(u64, usize)>,
) -> Result<Json<serde_json::Value>, Error> {
    let book = state.library.get_book(id).await?;
    let chapter = book
        .chapter(index)
        .ok_or(Error::ChapterNotFound { book_id: id, index })?;

    let image = state
        .image_client
        .illustrate(chapter, book.summaries.get(&index))
        .await?;
    state.library.set_image(id, index, image.clone()).await?;
    Ok(Json(serde_json::json!({ "success": true, "image": image })))
}

async fn check_credentials(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, Error> {
    let valid = state.library.store().verify_credentials().await?;
    Ok(Json(serde_json::json!({ "valid": valid })))
}
