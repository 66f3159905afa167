use std::sync::Arc;

use sqlx::PgPool;

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub async fn build(config: AppConfig) -> Result<Self, AppError> {
        let db_pool = crate::db::build_pool(&config).await?;
        if db_pool.is_none() {
            tracing::warn!("DATABASE_URL is not set; running without a database");
        }

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Dependency(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            http_client,
        })
    }

    pub fn pool(&self) -> Result<&PgPool, AppError> {
        self.db_pool.as_ref().ok_or_else(|| {
            AppError::Dependency("database is not configured; set DATABASE_URL".to_string())
        })
    }
}
