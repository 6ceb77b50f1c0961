use anyhow::{bail, Result};
use std::env;
use std::path::PathBuf;
use tracing::debug;

use crate::api::DEFAULT_BASE_URL;

pub const API_URL_VAR: &str = "BOOKLOG_API_URL";
pub const TOKEN_FILE_VAR: &str = "BOOKLOG_TOKEN_FILE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_url: String,
    pub token_file: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(None, None)
    }

    pub fn from_env_with(api_url: Option<String>, token_file: Option<PathBuf>) -> Result<Self> {
        let api_url = api_url.or_else(|| env::var(API_URL_VAR).ok());
        let token_file = token_file.or_else(|| env::var_os(TOKEN_FILE_VAR).map(PathBuf::from));
        Self::resolve(api_url, token_file)
    }

    pub fn resolve(api_url: Option<String>, token_file: Option<PathBuf>) -> Result<Self> {
        let api_url = api_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let api_url = api_url.trim().trim_end_matches('/').to_string();
        if api_url.is_empty() {
            bail!("{} must not be empty", API_URL_VAR);
        }
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            bail!("{} must be an http(s) URL, got '{}'", API_URL_VAR, api_url);
        }

        let token_file = token_file
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(default_token_file);
        debug!("Using API {} and token file {:?}", api_url, token_file);
        Ok(Self {
            api_url,
            token_file,
        })
    }
}

fn default_token_file() -> PathBuf {
    let home = env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".booklog").join("token")
}
