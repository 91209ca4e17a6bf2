//! Loads connection configuration from environment variables.
//! Follows the `DATABASE_URL` convention plus optional pool size overrides.

use std::env;
use once_cell::sync::Lazy;
use dotenvy::dotenv;

// Loads the .env file lazily, once.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // missing .env is fine
});

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_env() -> Self {
        // ensures .env has been loaded before we read the process environment
        Lazy::force(&DOTENV_LOADED);
        let url = env::var("DATABASE_URL").expect("DATABASE_URL not set");
        let min_connections = env::var("DATABASE_MIN_CONNECTIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(2);
        let max_connections = env::var("DATABASE_MAX_CONNECTIONS").ok().and_then(|v| v.parse().ok()).unwrap_or(16);
        Self { url, min_connections, max_connections }
    }
}

/// Forces early .env loading for callers that want it before any `from_env`.
pub fn init_dotenv() { Lazy::force(&DOTENV_LOADED); }
