pub mod api;
pub mod books;
pub mod config;
pub mod debounce;
pub mod error;
pub mod form;
pub mod models;
pub mod session;
pub mod token;

pub use api::{ApiClient, BookLogApi};
pub use books::BookCollection;
pub use error::{ApiError, ApiResult};
pub use form::{BookForm, FormField, FormState, SubmitOutcome};
pub use session::{SessionStatus, SessionStore};
pub use token::{FileTokenStore, MemoryTokenStore, TokenStore};
