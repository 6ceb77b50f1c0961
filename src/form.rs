use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::api::BookLogApi;
use crate::books::BookCollection;
use crate::debounce::Debouncer;
use crate::error::ApiResult;
use crate::models::{Book, BookId, BookPayload, ReadingStatus, SearchResult};

pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(500);
pub const MIN_QUERY_CHARS: usize = 2;
pub const RATING_RANGE: std::ops::RangeInclusive<u8> = 1..=5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormField {
    Title,
    Author,
    Isbn,
    Rating,
    PageCount,
    Notes,
    CoverUrl,
    DateFinished,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BookDraft {
    pub title: String,
    pub author: String,
    pub status: ReadingStatus,
    pub isbn: String,
    pub rating: String,
    pub page_count: String,
    pub notes: String,
    pub cover_url: String,
    pub date_finished: String,
}

impl BookDraft {
    pub fn from_book(book: &Book) -> Self {
        Self {
            title: book.title.clone(),
            author: book.author.clone(),
            status: book.status,
            isbn: book.isbn.clone().unwrap_or_default(),
            rating: book.rating.map(|r| r.to_string()).unwrap_or_default(),
            page_count: book.page_count.map(|p| p.to_string()).unwrap_or_default(),
            notes: book.notes.clone().unwrap_or_default(),
            cover_url: book.cover_url.clone().unwrap_or_default(),
            date_finished: book
                .date_finished
                .map(|d| d.to_string())
                .unwrap_or_default(),
        }
    }

    pub fn get(&self, field: FormField) -> &str {
        match field {
            FormField::Title => &self.title,
            FormField::Author => &self.author,
            FormField::Isbn => &self.isbn,
            FormField::Rating => &self.rating,
            FormField::PageCount => &self.page_count,
            FormField::Notes => &self.notes,
            FormField::CoverUrl => &self.cover_url,
            FormField::DateFinished => &self.date_finished,
        }
    }

    fn field_mut(&mut self, field: FormField) -> &mut String {
        match field {
            FormField::Title => &mut self.title,
            FormField::Author => &mut self.author,
            FormField::Isbn => &mut self.isbn,
            FormField::Rating => &mut self.rating,
            FormField::PageCount => &mut self.page_count,
            FormField::Notes => &mut self.notes,
            FormField::CoverUrl => &mut self.cover_url,
            FormField::DateFinished => &mut self.date_finished,
        }
    }

    pub fn set_status(&mut self, status: ReadingStatus) {
        self.status = status;
        if !status.is_ratable() {
            self.rating.clear();
        }
    }

    pub fn fill_from(&mut self, result: &SearchResult) {
        fill_blank(&mut self.title, Some(result.title.as_str()));
        fill_blank(&mut self.author, Some(result.author.as_str()));
        fill_blank(&mut self.isbn, result.isbn.as_deref());
        let pages = result
            .page_count
            .filter(|p| *p > 0)
            .map(|p| p.to_string());
        fill_blank(&mut self.page_count, pages.as_deref());
        fill_blank(&mut self.cover_url, result.cover_url.as_deref());
    }

    pub fn to_payload(&self) -> Result<BookPayload, String> {
        let rating = if self.status.is_ratable() {
            parse_number::<u8>(&self.rating, "rating")?
        } else {
            None
        };
        if let Some(r) = rating {
            if !RATING_RANGE.contains(&r) {
                return Err(format!(
                    "rating must be between {} and {}.",
                    RATING_RANGE.start(),
                    RATING_RANGE.end()
                ));
            }
        }
        let page_count = parse_number::<u32>(&self.page_count, "page_count")?;
        if page_count == Some(0) {
            return Err("page_count must be a positive whole number.".to_string());
        }
        let date_finished = if self.status == ReadingStatus::Finished {
            parse_date(&self.date_finished)?
        } else {
            None
        };

        Ok(BookPayload {
            title: self.title.trim().to_string(),
            author: self.author.trim().to_string(),
            status: self.status,
            isbn: non_empty(&self.isbn),
            rating,
            page_count,
            notes: non_empty(&self.notes),
            cover_url: non_empty(&self.cover_url),
            date_finished,
        })
    }
}

fn fill_blank(target: &mut String, value: Option<&str>) {
    if !target.trim().is_empty() {
        return;
    }
    if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
        *target = v.to_string();
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_number<T: FromStr>(value: &str, field: &str) -> Result<Option<T>, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|_| format!("{} must be a positive whole number.", field))
}

fn parse_date(value: &str) -> Result<Option<NaiveDate>, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<NaiveDate>()
        .map(Some)
        .map_err(|_| "date_finished must be a valid ISO date (YYYY-MM-DD).".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormMode {
    Create,
    Edit(BookId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormState {
    Editing,
    Searching,
    ResultsShown,
    Saving,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Saved(Book),
    Rejected(String),
    Busy,
    Closed,
}

#[derive(Debug, Default)]
struct SearchState {
    query: String,
    seq: u64,
    in_flight: Option<u64>,
    results: Vec<SearchResult>,
    visible: bool,
    error: Option<String>,
}

impl SearchState {
    fn reset_panel(&mut self) {
        self.in_flight = None;
        self.results.clear();
        self.visible = false;
        self.error = None;
    }
}

#[derive(Debug)]
struct FormInner {
    draft: BookDraft,
    search: SearchState,
    debouncer: Debouncer,
    saving: bool,
    closed: bool,
    error: Option<String>,
}

fn lock(inner: &Mutex<FormInner>) -> MutexGuard<'_, FormInner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct BookForm {
    api: Arc<dyn BookLogApi>,
    mode: FormMode,
    inner: Arc<Mutex<FormInner>>,
}

impl BookForm {
    pub fn new_entry(api: Arc<dyn BookLogApi>) -> Self {
        Self::with_draft(api, FormMode::Create, BookDraft::default())
    }

    pub fn edit(api: Arc<dyn BookLogApi>, book: &Book) -> Self {
        Self::with_draft(api, FormMode::Edit(book.id), BookDraft::from_book(book))
    }

    fn with_draft(api: Arc<dyn BookLogApi>, mode: FormMode, draft: BookDraft) -> Self {
        let inner = FormInner {
            draft,
            search: SearchState::default(),
            debouncer: Debouncer::new(SEARCH_DEBOUNCE),
            saving: false,
            closed: false,
            error: None,
        };
        Self {
            api,
            mode,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FormInner> {
        lock(&self.inner)
    }

    pub fn mode(&self) -> FormMode {
        self.mode
    }

    pub fn is_edit(&self) -> bool {
        matches!(self.mode, FormMode::Edit(_))
    }

    pub fn search_enabled(&self) -> bool {
        !self.is_edit()
    }

    pub fn state(&self) -> FormState {
        let inner = self.lock();
        if inner.closed {
            FormState::Closed
        } else if inner.saving {
            FormState::Saving
        } else if inner.search.in_flight.is_some() {
            FormState::Searching
        } else if inner.search.visible {
            FormState::ResultsShown
        } else {
            FormState::Editing
        }
    }

    pub fn draft(&self) -> BookDraft {
        self.lock().draft.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn can_rate(&self) -> bool {
        self.lock().draft.status.is_ratable()
    }

    pub fn shows_date_finished(&self) -> bool {
        self.lock().draft.status == ReadingStatus::Finished
    }

    pub fn query(&self) -> String {
        self.lock().search.query.clone()
    }

    pub fn results(&self) -> Vec<SearchResult> {
        self.lock().search.results.clone()
    }

    pub fn results_visible(&self) -> bool {
        self.lock().search.visible
    }

    pub fn is_searching(&self) -> bool {
        self.lock().search.in_flight.is_some()
    }

    pub fn search_error(&self) -> Option<String> {
        self.lock().search.error.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn set_field(&self, field: FormField, value: impl Into<String>) {
        let mut inner = self.lock();
        if field == FormField::Rating && !inner.draft.status.is_ratable() {
            debug!("Ignoring rating change for status {}", inner.draft.status);
            return;
        }
        *inner.draft.field_mut(field) = value.into();
    }

    pub fn set_status(&self, status: ReadingStatus) {
        self.lock().draft.set_status(status);
    }

    pub fn set_query(&self, text: &str) {
        if !self.search_enabled() {
            debug!("Search is not available while editing an existing book");
            return;
        }
        let mut inner = self.lock();
        inner.search.seq += 1;
        inner.search.query = text.to_string();

        let trimmed = text.trim();
        if trimmed.chars().count() < MIN_QUERY_CHARS {
            inner.debouncer.cancel();
            inner.search.reset_panel();
            return;
        }

        let seq = inner.search.seq;
        let action = run_search(
            Arc::downgrade(&self.inner),
            self.api.clone(),
            seq,
            trimmed.to_string(),
        );
        inner.debouncer.schedule(action);
    }

    pub fn select_result(&self, result: &SearchResult) {
        let mut inner = self.lock();
        inner.draft.fill_from(result);
        inner.search.seq += 1;
        inner.search.query.clear();
        inner.debouncer.cancel();
        inner.search.reset_panel();
    }

    pub fn close(&self) {
        let mut inner = self.lock();
        inner.debouncer.cancel();
        inner.search.seq += 1;
        inner.closed = true;
    }

    pub async fn submit<F, Fut>(&self, save: F) -> SubmitOutcome
    where
        F: FnOnce(BookPayload) -> Fut,
        Fut: Future<Output = ApiResult<Book>>,
    {
        let payload = {
            let mut inner = self.lock();
            if inner.closed {
                return SubmitOutcome::Closed;
            }
            if inner.saving {
                return SubmitOutcome::Busy;
            }
            inner.error = None;
            match inner.draft.to_payload() {
                Ok(payload) => {
                    inner.saving = true;
                    payload
                }
                Err(message) => {
                    inner.error = Some(message.clone());
                    return SubmitOutcome::Rejected(message);
                }
            }
        };

        let result = save(payload).await;

        let mut inner = self.lock();
        inner.saving = false;
        match result {
            Ok(book) => {
                info!("Saved '{}'", book.title);
                inner.closed = true;
                inner.debouncer.cancel();
                SubmitOutcome::Saved(book)
            }
            Err(e) => {
                let message = e.to_string();
                debug!("Save rejected: {}", message);
                inner.error = Some(message.clone());
                SubmitOutcome::Rejected(message)
            }
        }
    }

    pub async fn submit_to(&self, books: &BookCollection) -> SubmitOutcome {
        match self.mode {
            FormMode::Create => self.submit(|payload| books.create(payload)).await,
            FormMode::Edit(id) => self.submit(move |payload| books.update(id, payload)).await,
        }
    }
}

async fn run_search(
    inner: Weak<Mutex<FormInner>>,
    api: Arc<dyn BookLogApi>,
    seq: u64,
    query: String,
) {
    {
        let Some(shared) = inner.upgrade() else {
            return;
        };
        let mut guard = lock(&shared);
        if guard.search.seq != seq || guard.closed {
            return;
        }
        guard.search.in_flight = Some(seq);
    }

    debug!("Searching for '{}'", query);
    let outcome = api.search(&query).await;

    let Some(shared) = inner.upgrade() else {
        return;
    };
    let mut guard = lock(&shared);
    if guard.search.in_flight == Some(seq) {
        guard.search.in_flight = None;
    }
    // the query changed or was cleared while this lookup was in flight
    if guard.search.seq != seq {
        debug!("Discarding stale results for '{}'", query);
        return;
    }
    match outcome {
        Ok(results) => {
            debug!("{} results for '{}'", results.len(), query);
            guard.search.results = results;
            guard.search.error = None;
        }
        Err(e) => {
            debug!("Search for '{}' failed: {}", query, e);
            guard.search.results.clear();
            guard.search.error = Some(e.to_string());
        }
    }
    guard.search.visible = true;
}
