//! Gateway-owned tool backend: wires the product catalog and profile
//! store into the engine's tool executor.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use scoop_engine::provider::LlmClient;
use scoop_engine::ToolBackend;
use scoop_memory::{MemoryStore, ProductCatalog};

/// Products returned per search call.
const SEARCH_LIMIT: usize = 8;

pub struct CatalogToolBackend {
    store: Arc<MemoryStore>,
    catalog: Arc<ProductCatalog>,
    llm: Arc<dyn LlmClient>,
}

impl CatalogToolBackend {
    pub fn new(
        store: Arc<MemoryStore>,
        catalog: Arc<ProductCatalog>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            store,
            catalog,
            llm,
        }
    }
}

#[async_trait]
impl ToolBackend for CatalogToolBackend {
    async fn search_products(
        &self,
        user_id: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if query.is_empty() {
            return Err("query is required".to_string());
        }

        // Vector pass with embedding; on embedding failure the catalog
        // falls back to text matching on its own.
        let embedding = match self.llm.embed(query).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, query, "embedding failed, text search only");
                None
            }
        };

        let mut products = self
            .catalog
            .search(query, embedding.as_deref(), SEARCH_LIMIT)
            .map_err(|e| e.to_string())?;

        if let Some(max_price) = args.get("max_price").and_then(|v| v.as_f64()) {
            products.retain(|p| {
                p.get("price")
                    .and_then(|v| v.as_f64())
                    .map(|price| price <= max_price)
                    .unwrap_or(true)
            });
        }

        debug!(user_id, query, found = products.len(), "catalog search");
        Ok(json!({
            "products": products,
            "count": products.len(),
        }))
    }

    async fn update_profile(
        &self,
        user_id: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let patch = args
            .as_object()
            .ok_or_else(|| "profile update must be an object".to_string())?;
        let profile = self
            .store
            .update_profile_fields(user_id, patch)
            .map_err(|e| e.to_string())?;
        Ok(json!({
            "status": "ok",
            "profile": {
                "name": profile.name,
                "allergies": profile.allergies,
                "goals": profile.goals,
                "fitness_level": profile.fitness_level,
            },
        }))
    }

    async fn product_details(&self, args: &serde_json::Value) -> Result<serde_json::Value, String> {
        let product_id = args
            .get("product_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "product_id is required".to_string())?;
        match self.catalog.details(product_id).map_err(|e| e.to_string())? {
            Some(product) => Ok(product),
            None => Err(format!("product not found: {product_id}")),
        }
    }
}
