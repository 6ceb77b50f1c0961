use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use booklog::models::{Book, BookFilter, BookPayload, ReadingStatus, Stats};
use booklog::{
    ApiClient, ApiError, BookCollection, BookForm, BookLogApi, FormField, MemoryTokenStore,
    SessionStatus, SessionStore, SubmitOutcome, TokenStore,
};
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const TOKEN: &str = "token-reader-1";
const PASSWORD: &str = "correct-horse-battery";

#[derive(Default)]
struct BackendState {
    next_id: i64,
    books: Vec<Book>,
    payloads: Vec<Value>,
    auth_log: Vec<(String, Option<String>)>,
    search_queries: Vec<String>,
    fail_stats: bool,
}

type Shared = Arc<Mutex<BackendState>>;

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn record_auth(state: &mut BackendState, route: &str, headers: &HeaderMap) {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    state.auth_log.push((route.to_string(), auth));
}

fn check_auth(headers: &HeaderMap) -> Result<(), Response> {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Err(error(
            StatusCode::UNAUTHORIZED,
            "Authorization header missing or invalid.",
        ));
    };
    if value != format!("Bearer {}", TOKEN) {
        return Err(error(StatusCode::UNAUTHORIZED, "Token is invalid or expired."));
    }
    Ok(())
}

fn user_json() -> Value {
    json!({ "id": 1, "email": "reader@example.com", "name": "Reader" })
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

async fn register(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    record_auth(&mut state.lock().unwrap(), "register", &headers);
    let mut errors = Vec::new();
    if body["name"].as_str().map(str::trim).unwrap_or("").is_empty() {
        errors.push("name is required and cannot be empty.");
    }
    if body["password"].as_str().map(|p| p.len() < 8).unwrap_or(true) {
        errors.push("password must be at least 8 characters.");
    }
    if !errors.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "errors": errors }))).into_response();
    }
    if body["email"] == "taken@example.com" {
        return error(StatusCode::CONFLICT, "An account with that email already exists.");
    }
    (
        StatusCode::CREATED,
        Json(json!({ "token": TOKEN, "user": user_json() })),
    )
        .into_response()
}

async fn login(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    record_auth(&mut state.lock().unwrap(), "login", &headers);
    if body["email"] != "reader@example.com" || body["password"] != PASSWORD {
        return error(StatusCode::UNAUTHORIZED, "Invalid email or password.");
    }
    Json(json!({ "token": TOKEN, "user": user_json() })).into_response()
}

async fn me(State(state): State<Shared>, headers: HeaderMap) -> Response {
    record_auth(&mut state.lock().unwrap(), "me", &headers);
    if let Err(res) = check_auth(&headers) {
        return res;
    }
    Json(json!({ "user": user_json() })).into_response()
}

async fn list_books(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut st = state.lock().unwrap();
    record_auth(&mut st, "list", &headers);
    if let Err(res) = check_auth(&headers) {
        return res;
    }
    let books: Vec<Book> = st
        .books
        .iter()
        .filter(|b| {
            params
                .get("status")
                .map_or(true, |s| b.status.as_str() == s.as_str())
        })
        .filter(|b| params.get("author").map_or(true, |a| b.author.contains(a.as_str())))
        .cloned()
        .collect();
    Json(books).into_response()
}

async fn stats(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let st = state.lock().unwrap();
    if let Err(res) = check_auth(&headers) {
        return res;
    }
    if st.fail_stats {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "Stats are unavailable.");
    }
    let count = |status: ReadingStatus| st.books.iter().filter(|b| b.status == status).count();
    let ratings: Vec<f64> = st.books.iter().filter_map(|b| b.rating).map(f64::from).collect();
    let avg_rating = (!ratings.is_empty()).then(|| ratings.iter().sum::<f64>() / ratings.len() as f64);
    Json(json!({
        "total": st.books.len(),
        "finished": count(ReadingStatus::Finished),
        "reading": count(ReadingStatus::Reading),
        "want_to_read": count(ReadingStatus::WantToRead),
        "abandoned": count(ReadingStatus::Abandoned),
        "avg_rating": avg_rating,
        "total_pages": st.books.iter().filter_map(|b| b.page_count).map(u64::from).sum::<u64>(),
    }))
    .into_response()
}

fn validate(body: &Value, partial: bool) -> Vec<String> {
    let mut errors = Vec::new();
    for field in ["title", "author"] {
        let present = body.get(field).is_some();
        if (!partial || present) && body[field].as_str().map(str::trim).unwrap_or("").is_empty() {
            errors.push(format!("{} is required and cannot be empty.", field));
        }
    }
    if let Some(status) = body.get("status") {
        if status.as_str().and_then(|s| s.parse::<ReadingStatus>().ok()).is_none() {
            errors.push("status must be one of: want_to_read, reading, finished, abandoned.".to_string());
        }
    } else if !partial {
        errors.push("status is required.".to_string());
    }
    for field in ["rating", "page_count"] {
        if let Some(v) = body.get(field) {
            if !v.is_u64() {
                errors.push(format!("{} must be an integer.", field));
            }
        }
    }
    errors
}

fn apply(book: &mut Book, body: &Value) {
    if let Some(v) = body["title"].as_str() {
        book.title = v.trim().to_string();
    }
    if let Some(v) = body["author"].as_str() {
        book.author = v.trim().to_string();
    }
    if let Some(v) = body["status"].as_str().and_then(|s| s.parse().ok()) {
        book.status = v;
    }
    if let Some(v) = body.get("isbn") {
        book.isbn = v.as_str().map(str::to_string);
    }
    if let Some(v) = body.get("rating") {
        book.rating = v.as_u64().map(|r| r as u8);
    }
    if let Some(v) = body.get("page_count") {
        book.page_count = v.as_u64().map(|p| p as u32);
    }
    if let Some(v) = body.get("notes") {
        book.notes = v.as_str().map(str::to_string);
    }
    if let Some(v) = body.get("cover_url") {
        book.cover_url = v.as_str().map(str::to_string);
    }
    if let Some(v) = body.get("date_finished") {
        book.date_finished = v.as_str().and_then(|d| d.parse().ok());
    }
}

async fn create_book(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut st = state.lock().unwrap();
    if let Err(res) = check_auth(&headers) {
        return res;
    }
    st.payloads.push(body.clone());
    let errors = validate(&body, false);
    if !errors.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "errors": errors }))).into_response();
    }
    st.next_id += 1;
    let mut book = Book {
        id: st.next_id,
        title: String::new(),
        author: String::new(),
        status: ReadingStatus::WantToRead,
        isbn: None,
        rating: None,
        page_count: None,
        notes: None,
        cover_url: None,
        date_added: Some(today()),
        date_finished: None,
    };
    apply(&mut book, &body);
    if book.rating.is_some() && !book.status.is_ratable() {
        return error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Rating can only be set when status is finished or abandoned.",
        );
    }
    if book.status == ReadingStatus::Finished && book.date_finished.is_none() {
        book.date_finished = Some(today());
    }
    st.books.push(book.clone());
    (StatusCode::CREATED, Json(book)).into_response()
}

async fn get_book(State(state): State<Shared>, headers: HeaderMap, Path(id): Path<i64>) -> Response {
    let st = state.lock().unwrap();
    if let Err(res) = check_auth(&headers) {
        return res;
    }
    match st.books.iter().find(|b| b.id == id) {
        Some(book) => Json(book.clone()).into_response(),
        None => error(StatusCode::NOT_FOUND, &format!("Book {} not found.", id)),
    }
}

async fn update_book(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Response {
    let mut st = state.lock().unwrap();
    if let Err(res) = check_auth(&headers) {
        return res;
    }
    st.payloads.push(body.clone());
    let errors = validate(&body, true);
    if !errors.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "errors": errors }))).into_response();
    }
    let Some(book) = st.books.iter_mut().find(|b| b.id == id) else {
        return error(StatusCode::NOT_FOUND, &format!("Book {} not found.", id));
    };
    let was_finished = book.status == ReadingStatus::Finished;
    let mut updated = book.clone();
    apply(&mut updated, &body);
    if !updated.status.is_ratable() && body.get("rating").is_none() {
        updated.rating = None;
    }
    if updated.rating.is_some() && !updated.status.is_ratable() {
        return error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Rating can only be set when status is finished or abandoned.",
        );
    }
    if updated.status == ReadingStatus::Finished && !was_finished && body.get("date_finished").is_none() {
        updated.date_finished = Some(today());
    }
    *book = updated.clone();
    Json(updated).into_response()
}

async fn delete_book(State(state): State<Shared>, headers: HeaderMap, Path(id): Path<i64>) -> Response {
    let mut st = state.lock().unwrap();
    if let Err(res) = check_auth(&headers) {
        return res;
    }
    let before = st.books.len();
    st.books.retain(|b| b.id != id);
    if st.books.len() == before {
        return error(StatusCode::NOT_FOUND, &format!("Book {} not found.", id));
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn search(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut st = state.lock().unwrap();
    if let Err(res) = check_auth(&headers) {
        return res;
    }
    let query = params.get("q").cloned().unwrap_or_default();
    st.search_queries.push(query.clone());
    if query.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "Query parameter 'q' is required.");
    }
    Json(json!({
        "results": [
            {
                "title": "The Left Hand of Darkness",
                "author": "Ursula K. Le Guin",
                "isbn": "9780441478125",
                "page_count": 304,
                "cover_url": "https://covers.openlibrary.org/b/id/1-M.jpg"
            },
            { "title": "The Lathe of Heaven", "author": "Ursula K. Le Guin", "isbn": null, "page_count": null, "cover_url": null }
        ]
    }))
    .into_response()
}

async fn spawn_backend() -> (String, Shared) {
    let state: Shared = Arc::new(Mutex::new(BackendState::default()));
    let app = Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(me))
        .route("/api/books", get(list_books).post(create_book))
        .route("/api/books/stats", get(stats))
        .route(
            "/api/books/:id",
            get(get_book).patch(update_book).delete(delete_book),
        )
        .route("/api/search", get(search))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/api/", addr), state)
}

struct Client {
    api: Arc<dyn BookLogApi>,
    tokens: Arc<MemoryTokenStore>,
    session: SessionStore,
    books: BookCollection,
}

fn client_for(base_url: &str, tokens: Arc<MemoryTokenStore>) -> Client {
    let api: Arc<dyn BookLogApi> = Arc::new(ApiClient::new(base_url, tokens.clone()).unwrap());
    Client {
        session: SessionStore::new(api.clone(), tokens.clone()),
        books: BookCollection::new(api.clone()),
        api,
        tokens,
    }
}

async fn signed_in(base_url: &str) -> Client {
    let client = client_for(base_url, Arc::new(MemoryTokenStore::new()));
    client
        .session
        .login("reader@example.com", PASSWORD)
        .await
        .expect("login should succeed");
    client
}

async fn add_dune(client: &Client) -> Book {
    let form = BookForm::new_entry(client.api.clone());
    form.set_field(FormField::Title, "Dune");
    form.set_field(FormField::Author, "Frank Herbert");
    form.set_status(ReadingStatus::WantToRead);
    match form.submit_to(&client.books).await {
        SubmitOutcome::Saved(book) => book,
        other => panic!("expected save, got {:?}", other),
    }
}

#[tokio::test]
async fn creating_a_book_updates_list_and_stats() {
    let (url, backend) = spawn_backend().await;
    let client = signed_in(&url).await;

    client.books.load(BookFilter::default()).await.unwrap();
    assert_eq!(client.books.stats().unwrap().total, 0);

    let book = add_dune(&client).await;
    assert_eq!(book.rating, None);
    assert_eq!(book.date_finished, None);

    let sent = backend.lock().unwrap().payloads.last().cloned().unwrap();
    assert_eq!(
        sent,
        json!({ "title": "Dune", "author": "Frank Herbert", "status": "want_to_read" })
    );

    assert_eq!(client.books.books().first().map(|b| b.id), Some(book.id));
    assert_eq!(client.books.stats().unwrap().total, 1);

    client.books.reload().await.unwrap();
    assert!(client.books.books().iter().any(|b| b.title == "Dune"));
}

#[tokio::test]
async fn finishing_with_a_rating_sends_a_number() {
    let (url, backend) = spawn_backend().await;
    let client = signed_in(&url).await;
    client.books.load(BookFilter::default()).await.unwrap();
    let dune = add_dune(&client).await;

    let form = BookForm::edit(client.api.clone(), &dune);
    form.set_status(ReadingStatus::Finished);
    form.set_field(FormField::Rating, "5");
    let updated = match form.submit_to(&client.books).await {
        SubmitOutcome::Saved(book) => book,
        other => panic!("expected save, got {:?}", other),
    };
    assert!(form.is_closed());

    let sent = backend.lock().unwrap().payloads.last().cloned().unwrap();
    assert_eq!(sent["rating"], json!(5));
    assert_eq!(sent["status"], json!("finished"));
    assert!(sent.get("date_finished").is_none());

    assert_eq!(updated.rating, Some(5));
    assert_eq!(updated.date_finished, Some(today()));
    assert_eq!(client.books.books()[0], updated);

    let stats = client.books.stats().unwrap();
    assert_eq!(stats.finished, 1);
    assert_eq!(stats.avg_rating, Some(5.0));
}

#[tokio::test]
async fn deleting_a_missing_book_leaves_the_collection_alone() {
    let (url, _backend) = spawn_backend().await;
    let client = signed_in(&url).await;
    client.books.load(BookFilter::default()).await.unwrap();
    add_dune(&client).await;
    let before = client.books.books();

    let err = client.books.delete(999).await.unwrap_err();
    assert_eq!(err.to_string(), "Book 999 not found.");
    assert_eq!(err.status(), Some(404));
    assert_eq!(client.books.books(), before);
}

#[tokio::test]
async fn deleting_removes_the_book_and_refreshes_stats() {
    let (url, _backend) = spawn_backend().await;
    let client = signed_in(&url).await;
    client.books.load(BookFilter::default()).await.unwrap();
    let dune = add_dune(&client).await;

    client.books.delete(dune.id).await.unwrap();
    assert!(client.books.books().is_empty());
    assert_eq!(client.books.stats().unwrap().total, 0);
}

#[tokio::test]
async fn restore_with_invalid_token_ends_logged_out() {
    let (url, _backend) = spawn_backend().await;
    let client = client_for(&url, Arc::new(MemoryTokenStore::with_token("expired")));

    assert_eq!(client.session.restore().await, None);
    assert_eq!(client.session.status(), SessionStatus::LoggedOut);
    assert_eq!(client.tokens.get(), None);
}

#[tokio::test]
async fn restore_with_valid_token_adopts_user() {
    let (url, _backend) = spawn_backend().await;
    let client = client_for(&url, Arc::new(MemoryTokenStore::with_token(TOKEN)));
    let user = client.session.restore().await.unwrap();
    assert_eq!(user.email, "reader@example.com");
    assert!(client.session.is_authenticated());
}

#[tokio::test]
async fn bearer_header_follows_the_token_store() {
    let (url, backend) = spawn_backend().await;
    let client = client_for(&url, Arc::new(MemoryTokenStore::new()));

    client
        .session
        .login("reader@example.com", PASSWORD)
        .await
        .unwrap();
    client.books.load(BookFilter::default()).await.unwrap();

    client.session.logout();
    let err = client.books.load(BookFilter::default()).await.unwrap_err();
    assert_eq!(err.to_string(), "Authorization header missing or invalid.");
    assert!(err.is_unauthorized());

    let log = backend.lock().unwrap().auth_log.clone();
    assert_eq!(
        log,
        vec![
            ("login".to_string(), None),
            ("list".to_string(), Some(format!("Bearer {}", TOKEN))),
            ("list".to_string(), None),
        ]
    );
}

#[tokio::test]
async fn failed_login_and_register_report_server_messages() {
    let (url, backend) = spawn_backend().await;
    let client = client_for(&url, Arc::new(MemoryTokenStore::new()));

    let err = client
        .session
        .login("reader@example.com", "nope")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid email or password.");

    let err = client
        .session
        .register("new@example.com", "short", "")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "name is required and cannot be empty. • password must be at least 8 characters."
    );

    let err = client
        .session
        .register("taken@example.com", PASSWORD, "Someone")
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(409));

    assert_eq!(client.session.user(), None);
    assert_eq!(client.tokens.get(), None);
    assert!(backend
        .lock()
        .unwrap()
        .auth_log
        .iter()
        .all(|(_, auth)| auth.is_none()));

    let user = client
        .session
        .register("new@example.com", PASSWORD, "Reader")
        .await
        .unwrap();
    assert_eq!(user.name, "Reader");
    assert_eq!(client.tokens.get().as_deref(), Some(TOKEN));
}

#[tokio::test]
async fn rejected_save_keeps_the_form_open() {
    let (url, _backend) = spawn_backend().await;
    let client = signed_in(&url).await;
    client.books.load(BookFilter::default()).await.unwrap();

    let form = BookForm::new_entry(client.api.clone());
    form.set_field(FormField::Title, "   ");
    let outcome = form.submit_to(&client.books).await;
    assert_eq!(
        outcome,
        SubmitOutcome::Rejected(
            "title is required and cannot be empty. • author is required and cannot be empty."
                .to_string()
        )
    );
    assert!(!form.is_closed());
    assert_eq!(form.error().as_deref(), Some(
        "title is required and cannot be empty. • author is required and cannot be empty."
    ));
    assert!(client.books.books().is_empty());

    form.set_field(FormField::Title, "Dune");
    form.set_field(FormField::Author, "Frank Herbert");
    assert!(matches!(
        form.submit_to(&client.books).await,
        SubmitOutcome::Saved(_)
    ));
    assert_eq!(form.error(), None);
}

#[tokio::test]
async fn partial_load_failure_applies_the_other_half() {
    let (url, backend) = spawn_backend().await;
    let client = signed_in(&url).await;
    client.books.load(BookFilter::default()).await.unwrap();
    add_dune(&client).await;
    let before_stats = client.books.stats();

    backend.lock().unwrap().fail_stats = true;
    let err = client.books.reload().await.unwrap_err();
    assert_eq!(err.to_string(), "Stats are unavailable.");
    assert_eq!(client.books.error().as_deref(), Some("Stats are unavailable."));
    assert_eq!(client.books.books().len(), 1);
    assert_eq!(client.books.stats(), before_stats);
    assert!(!client.books.is_loading());

    // mutations still land even when the follow-up stats refresh fails
    let mut payload = BookPayload::new("Kindred", "Octavia E. Butler", ReadingStatus::Reading);
    payload.page_count = Some(264);
    client.books.create(payload).await.unwrap();
    assert_eq!(client.books.books()[0].title, "Kindred");
    assert_eq!(client.books.stats(), before_stats);
}

#[tokio::test]
async fn list_filters_reach_the_server() {
    let (url, _backend) = spawn_backend().await;
    let client = signed_in(&url).await;
    add_dune(&client).await;
    let mut finished = BookPayload::new("Parable of the Sower", "Octavia E. Butler", ReadingStatus::Finished);
    finished.rating = Some(4);
    client.api.create_book(&finished).await.unwrap();

    client
        .books
        .load(BookFilter::by_status(ReadingStatus::Finished))
        .await
        .unwrap();
    let titles: Vec<String> = client.books.books().into_iter().map(|b| b.title).collect();
    assert_eq!(titles, vec!["Parable of the Sower".to_string()]);

    client
        .books
        .load(BookFilter {
            status: None,
            author: Some("Frank Herbert".to_string()),
        })
        .await
        .unwrap();
    let titles: Vec<String> = client.books.books().into_iter().map(|b| b.title).collect();
    assert_eq!(titles, vec!["Dune".to_string()]);
    assert_eq!(client.books.stats().unwrap().total, 2);
}

#[tokio::test]
async fn search_encodes_the_query() {
    let (url, backend) = spawn_backend().await;
    let client = signed_in(&url).await;

    let results = client.api.search("le guin & co").await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].page_count, Some(304));
    assert_eq!(results[1].isbn, None);
    assert_eq!(
        backend.lock().unwrap().search_queries,
        vec!["le guin & co".to_string()]
    );
}

#[tokio::test]
async fn get_book_returns_the_stored_record() {
    let (url, _backend) = spawn_backend().await;
    let client = signed_in(&url).await;
    let dune = add_dune(&client).await;

    assert_eq!(client.api.get_book(dune.id).await.unwrap(), dune);
    let err = client.api.get_book(dune.id + 1).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
}

#[tokio::test]
async fn unreachable_backend_reports_network_error() {
    let client = client_for("http://127.0.0.1:1/api", Arc::new(MemoryTokenStore::with_token(TOKEN)));

    let err = client.api.stats().await.unwrap_err();
    assert_eq!(err, ApiError::Network);
    assert_eq!(err.to_string(), "Cannot reach server. Is the backend running?");

    // restore treats an unreachable backend like a rejected token
    assert_eq!(client.session.restore().await, None);
    assert_eq!(client.session.status(), SessionStatus::LoggedOut);
}

#[tokio::test]
async fn stats_decode_with_nullable_average() {
    let (url, _backend) = spawn_backend().await;
    let client = signed_in(&url).await;
    let stats = client.api.stats().await.unwrap();
    assert_eq!(stats, Stats::default());
}
