use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::models::{
    AuthResponse, Book, BookFilter, BookId, BookPayload, MeResponse, SearchResponse,
    SearchResult, Stats, User,
};
use crate::token::TokenStore;

pub const DEFAULT_BASE_URL: &str = "http://localhost:5000/api";

#[async_trait]
pub trait BookLogApi: Send + Sync {
    async fn register(&self, email: &str, password: &str, name: &str) -> ApiResult<AuthResponse>;
    async fn login(&self, email: &str, password: &str) -> ApiResult<AuthResponse>;
    async fn me(&self) -> ApiResult<User>;
    async fn list_books(&self, filter: &BookFilter) -> ApiResult<Vec<Book>>;
    async fn get_book(&self, id: BookId) -> ApiResult<Book>;
    async fn stats(&self) -> ApiResult<Stats>;
    async fn create_book(&self, payload: &BookPayload) -> ApiResult<Book>;
    async fn update_book(&self, id: BookId, payload: &BookPayload) -> ApiResult<Book>;
    async fn delete_book(&self, id: BookId) -> ApiResult<()>;
    async fn search(&self, query: &str) -> ApiResult<Vec<SearchResult>>;
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
}

impl ApiClient {
    pub fn new(base_url: &str, tokens: Arc<dyn TokenStore>) -> Result<Self> {
        let user_agent = format!("booklog/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        auth: bool,
    ) -> ApiResult<Option<Vec<u8>>> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method.clone(), &url);
        if auth {
            if let Some(token) = self.tokens.get() {
                req = req.bearer_auth(token);
            }
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        debug!("{} {}", method, path);
        let res = req.send().await.map_err(|e| {
            warn!("{} {} failed: {}", method, path, e);
            ApiError::Network
        })?;

        let status = res.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let bytes = res.bytes().await.map_err(|e| {
            warn!("Reading body of {} {} failed: {}", method, path, e);
            ApiError::Network
        })?;
        if !status.is_success() {
            let err = ApiError::from_response(status.as_u16(), &bytes);
            debug!("{} {} -> {}: {}", method, path, status, err);
            return Err(err);
        }
        Ok(Some(bytes.to_vec()))
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        auth: bool,
    ) -> ApiResult<T> {
        let bytes = self
            .execute(method, path, body, auth)
            .await?
            .ok_or_else(|| ApiError::Decode(format!("{} returned no body", path)))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            warn!("Failed to decode response from {}: {}", path, e);
            ApiError::Decode(e.to_string())
        })
    }
}

fn to_body<T: serde::Serialize>(value: &T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl BookLogApi for ApiClient {
    async fn register(&self, email: &str, password: &str, name: &str) -> ApiResult<AuthResponse> {
        let body = json!({ "email": email, "password": password, "name": name });
        self.request_json(Method::POST, "/auth/register", Some(body), false)
            .await
    }

    async fn login(&self, email: &str, password: &str) -> ApiResult<AuthResponse> {
        let body = json!({ "email": email, "password": password });
        self.request_json(Method::POST, "/auth/login", Some(body), false)
            .await
    }

    async fn me(&self) -> ApiResult<User> {
        let res: MeResponse = self
            .request_json(Method::GET, "/auth/me", None, true)
            .await?;
        Ok(res.user)
    }

    async fn list_books(&self, filter: &BookFilter) -> ApiResult<Vec<Book>> {
        let qs = filter.query_string();
        let path = if qs.is_empty() {
            "/books".to_string()
        } else {
            format!("/books?{}", qs)
        };
        self.request_json(Method::GET, &path, None, true).await
    }

    async fn get_book(&self, id: BookId) -> ApiResult<Book> {
        self.request_json(Method::GET, &format!("/books/{id}"), None, true)
            .await
    }

    async fn stats(&self) -> ApiResult<Stats> {
        self.request_json(Method::GET, "/books/stats", None, true)
            .await
    }

    async fn create_book(&self, payload: &BookPayload) -> ApiResult<Book> {
        self.request_json(Method::POST, "/books", Some(to_body(payload)?), true)
            .await
    }

    async fn update_book(&self, id: BookId, payload: &BookPayload) -> ApiResult<Book> {
        self.request_json(
            Method::PATCH,
            &format!("/books/{id}"),
            Some(to_body(payload)?),
            true,
        )
        .await
    }

    async fn delete_book(&self, id: BookId) -> ApiResult<()> {
        self.execute(Method::DELETE, &format!("/books/{id}"), None, true)
            .await
            .map(|_| ())
    }

    async fn search(&self, query: &str) -> ApiResult<Vec<SearchResult>> {
        let path = format!("/search?q={}", urlencoding::encode(query));
        let res: SearchResponse = self.request_json(Method::GET, &path, None, true).await?;
        Ok(res.results)
    }
}
