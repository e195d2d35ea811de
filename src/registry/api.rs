use async_trait::async_trait;
use log::debug;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use url::Url;

use crate::llm::{ check_status, LlmConfig, LlmError };
use crate::models::model::{ LoadParams, ModelEntry };

/// The dashboard's model management endpoints.
#[async_trait]
pub trait ModelApi: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelEntry>, LlmError>;

    async fn model_details(&self, id: &str) -> Result<ModelEntry, LlmError>;

    async fn load_model(&self, id: &str, params: &LoadParams) -> Result<(), LlmError>;

    async fn unload_model(&self, id: &str) -> Result<(), LlmError>;

    /// Returns how many model files the server found.
    async fn scan_models(&self) -> Result<usize, LlmError>;

    async fn set_favorite(&self, id: &str, favorite: bool) -> Result<(), LlmError>;

    async fn health(&self) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct FavoriteRequest {
    favorite: bool,
}

#[derive(Deserialize)]
struct ScanResponse {
    #[serde(default)]
    scanned: usize,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

pub struct HttpModelApi {
    http: HttpClient,
    config: LlmConfig,
}

impl HttpModelApi {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        Ok(Self {
            http: config.http_client()?,
            config: config.clone(),
        })
    }

    // Model ids are file stems and may contain characters that need escaping.
    fn model_route(&self, id: &str, action: &str) -> Result<Url, LlmError> {
        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                LlmError::InvalidConfig(format!("'{}' cannot be used as a base URL", self.config.base_url))
            })?
            .pop_if_empty()
            .extend(["api", "models", id, action]);
        Ok(url)
    }
}

#[async_trait]
impl ModelApi for HttpModelApi {
    async fn list_models(&self) -> Result<Vec<ModelEntry>, LlmError> {
        let resp = self.http.get(self.config.endpoint("/api/models")).send().await?;
        let models = check_status(resp).await?.json::<Vec<ModelEntry>>().await?;
        debug!("Fetched {} models", models.len());
        Ok(models)
    }

    async fn model_details(&self, id: &str) -> Result<ModelEntry, LlmError> {
        let resp = self.http.get(self.model_route(id, "details")?).send().await?;
        Ok(check_status(resp).await?.json::<ModelEntry>().await?)
    }

    async fn load_model(&self, id: &str, params: &LoadParams) -> Result<(), LlmError> {
        let resp = self.http.post(self.model_route(id, "load")?).json(params).send().await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn unload_model(&self, id: &str) -> Result<(), LlmError> {
        let resp = self.http.post(self.model_route(id, "unload")?).send().await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn scan_models(&self) -> Result<usize, LlmError> {
        let resp = self.http.post(self.config.endpoint("/api/models/scan")).send().await?;
        let scan = check_status(resp).await?.json::<ScanResponse>().await?;
        Ok(scan.scanned)
    }

    async fn set_favorite(&self, id: &str, favorite: bool) -> Result<(), LlmError> {
        let resp = self.http
            .put(self.model_route(id, "favorite")?)
            .json(&(FavoriteRequest { favorite }))
            .send().await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn health(&self) -> Result<String, LlmError> {
        let resp = self.http.get(self.config.endpoint("/health")).send().await?;
        let health = check_status(resp).await?.json::<HealthResponse>().await?;
        Ok(health.status)
    }
}
