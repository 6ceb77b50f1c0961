use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::api::BookLogApi;
use crate::error::ApiResult;
use crate::models::{Book, BookFilter, BookId, BookPayload, Stats};

#[derive(Debug, Default)]
struct CollectionState {
    books: Vec<Book>,
    stats: Option<Stats>,
    filter: BookFilter,
    loading: bool,
    error: Option<String>,
}

pub struct BookCollection {
    api: Arc<dyn BookLogApi>,
    state: Mutex<CollectionState>,
}

impl BookCollection {
    pub fn new(api: Arc<dyn BookLogApi>) -> Self {
        Self {
            api,
            state: Mutex::new(CollectionState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn books(&self) -> Vec<Book> {
        self.lock().books.clone()
    }

    pub fn stats(&self) -> Option<Stats> {
        self.lock().stats.clone()
    }

    pub fn filter(&self) -> BookFilter {
        self.lock().filter.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading
    }

    pub async fn load(&self, filter: BookFilter) -> ApiResult<()> {
        {
            let mut state = self.lock();
            state.filter = filter.clone();
            state.loading = true;
            state.error = None;
        }

        let (books_res, stats_res) = tokio::join!(self.api.list_books(&filter), self.api.stats());

        let mut state = self.lock();
        state.loading = false;
        let mut first_error = None;
        match books_res {
            Ok(books) => {
                debug!("Loaded {} books", books.len());
                state.books = books;
            }
            Err(e) => {
                warn!("Failed to load books: {}", e);
                first_error = Some(e);
            }
        }
        match stats_res {
            Ok(stats) => state.stats = Some(stats),
            Err(e) => {
                warn!("Failed to load stats: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                state.error = Some(e.to_string());
                Err(e)
            }
            None => Ok(()),
        }
    }

    pub async fn reload(&self) -> ApiResult<()> {
        let filter = self.filter();
        self.load(filter).await
    }

    pub async fn create(&self, payload: BookPayload) -> ApiResult<Book> {
        let book = self.api.create_book(&payload).await?;
        info!("Added '{}' (id {})", book.title, book.id);
        self.lock().books.insert(0, book.clone());
        self.refresh_stats().await;
        Ok(book)
    }

    pub async fn update(&self, id: BookId, payload: BookPayload) -> ApiResult<Book> {
        let book = self.api.update_book(id, &payload).await?;
        info!("Updated '{}' (id {})", book.title, book.id);
        {
            let mut state = self.lock();
            for existing in state.books.iter_mut().filter(|b| b.id == id) {
                *existing = book.clone();
            }
        }
        self.refresh_stats().await;
        Ok(book)
    }

    pub async fn delete(&self, id: BookId) -> ApiResult<()> {
        self.api.delete_book(id).await?;
        info!("Deleted book {}", id);
        self.lock().books.retain(|b| b.id != id);
        self.refresh_stats().await;
        Ok(())
    }

    async fn refresh_stats(&self) {
        match self.api.stats().await {
            Ok(stats) => self.lock().stats = Some(stats),
            Err(e) => warn!("Failed to refresh stats, keeping previous values: {}", e),
        }
    }
}
