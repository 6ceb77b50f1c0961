use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::api::BookLogApi;
use crate::error::ApiResult;
use crate::models::{AuthResponse, User};
use crate::token::TokenStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Loading,
    LoggedOut,
    LoggedIn(User),
}

pub struct SessionStore {
    api: Arc<dyn BookLogApi>,
    tokens: Arc<dyn TokenStore>,
    status: Mutex<SessionStatus>,
}

impl SessionStore {
    pub fn new(api: Arc<dyn BookLogApi>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            api,
            tokens,
            status: Mutex::new(SessionStatus::Loading),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionStatus> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().clone()
    }

    pub fn user(&self) -> Option<User> {
        match &*self.lock() {
            SessionStatus::LoggedIn(user) => Some(user.clone()),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(*self.lock(), SessionStatus::LoggedIn(_))
    }

    pub async fn login(&self, email: &str, password: &str) -> ApiResult<User> {
        let res = self.api.login(email, password).await?;
        Ok(self.adopt(res))
    }

    pub async fn register(&self, email: &str, password: &str, name: &str) -> ApiResult<User> {
        let res = self.api.register(email, password, name).await?;
        Ok(self.adopt(res))
    }

    fn adopt(&self, res: AuthResponse) -> User {
        self.tokens.set(&res.token);
        info!("Signed in as {}", res.user.email);
        *self.lock() = SessionStatus::LoggedIn(res.user.clone());
        res.user
    }

    pub async fn restore(&self) -> Option<User> {
        if self.tokens.get().is_none() {
            debug!("No stored token, starting logged out");
            *self.lock() = SessionStatus::LoggedOut;
            return None;
        }

        match self.api.me().await {
            Ok(user) => {
                info!("Restored session for {}", user.email);
                *self.lock() = SessionStatus::LoggedIn(user.clone());
                Some(user)
            }
            Err(e) => {
                debug!("Stored token rejected ({}), discarding it", e);
                self.tokens.clear();
                *self.lock() = SessionStatus::LoggedOut;
                None
            }
        }
    }

    pub fn logout(&self) {
        self.tokens.clear();
        *self.lock() = SessionStatus::LoggedOut;
        info!("Signed out");
    }
}
