use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info, warn};

use scoop_core::FunctionCall;

use crate::provider::ToolDefinition;

/// Backing implementations of the four user tools. Injected so the
/// gateway can wire the catalog and profile store in, and tests can
/// script results.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Semantic product search. Returns `{"products": [...], "count": n}`.
    async fn search_products(
        &self,
        user_id: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, String>;

    /// Persist profile fields and return the updated profile document.
    async fn update_profile(
        &self,
        user_id: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, String>;

    /// Product details by id.
    async fn product_details(&self, args: &serde_json::Value) -> Result<serde_json::Value, String>;
}

/// Result of one tool execution. Errors never escape this boundary —
/// they are captured as `{"error": …}` in the response payload.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub name: String,
    pub response: serde_json::Value,
    pub products: Vec<serde_json::Value>,
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

impl ToolResult {
    fn plain(name: &str, response: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            response,
            products: Vec::new(),
            skipped: false,
            skip_reason: None,
        }
    }

    fn error(name: &str, message: String) -> Self {
        Self::plain(name, json!({ "error": message }))
    }
}

/// Per-request tool dispatcher with explicit user context.
///
/// `user_id` is passed to every tool — there is no implicit per-task
/// context. The profile is pre-cached at construction so
/// `get_user_profile` costs no I/O and no extra LLM round.
pub struct ToolExecutor {
    user_id: String,
    profile: serde_json::Value,
    backend: Arc<dyn ToolBackend>,
    max_unique_queries: usize,
    executed_queries: HashSet<String>,
    all_products: Vec<serde_json::Value>,
}

impl ToolExecutor {
    pub fn new(
        user_id: impl Into<String>,
        profile: serde_json::Value,
        backend: Arc<dyn ToolBackend>,
        max_unique_queries: usize,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            profile,
            backend,
            max_unique_queries,
            executed_queries: HashSet::new(),
            all_products: Vec::new(),
        }
    }

    /// Execute one call. Unknown tools and backend failures come back as
    /// error payloads, never as Rust errors.
    pub async fn execute(&mut self, call: &FunctionCall) -> ToolResult {
        info!(tool = %call.name, user = %self.user_id, "executing tool");

        match call.name.as_str() {
            "search_products" => self.execute_search(&call.args).await,
            "get_user_profile" => self.execute_get_profile(),
            "update_user_profile" => self.execute_update_profile(&call.args).await,
            "get_product_details" => match self.backend.product_details(&call.args).await {
                Ok(response) => ToolResult::plain("get_product_details", response),
                Err(e) => {
                    error!(error = %e, "get_product_details failed");
                    ToolResult::error("get_product_details", e)
                }
            },
            other => {
                warn!(tool = other, "unknown tool");
                ToolResult::error(other, format!("Unknown function: {other}"))
            }
        }
    }

    /// Execute a batch sequentially. With `dedupe_search`, only the first
    /// product search in the batch runs; later ones are marked
    /// `batch_duplicate`. Non-search tools all run.
    pub async fn execute_batch(
        &mut self,
        calls: &[FunctionCall],
        dedupe_search: bool,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        let mut search_seen = false;

        for call in calls {
            if dedupe_search && call.name == "search_products" {
                if search_seen {
                    warn!("skipping duplicate search_products in batch");
                    results.push(ToolResult {
                        name: call.name.clone(),
                        response: json!({ "note": "Skipped duplicate search in batch" }),
                        products: Vec::new(),
                        skipped: true,
                        skip_reason: Some("batch_duplicate".to_string()),
                    });
                    continue;
                }
                search_seen = true;
            }
            results.push(self.execute(call).await);
        }
        results
    }

    /// Products accumulated across every search so far.
    pub fn all_products(&self) -> &[serde_json::Value] {
        &self.all_products
    }

    pub fn unique_query_count(&self) -> usize {
        self.executed_queries.len()
    }

    async fn execute_search(&mut self, args: &serde_json::Value) -> ToolResult {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        let query_key = query.to_lowercase();

        if self.executed_queries.contains(&query_key) {
            warn!(query = %query, "duplicate query skipped");
            return ToolResult {
                name: "search_products".to_string(),
                response: json!({
                    "products": self.all_products,
                    "count": self.all_products.len(),
                    "note": format!("Duplicate query '{query}', returning cached results"),
                }),
                products: self.all_products.clone(),
                skipped: true,
                skip_reason: Some("duplicate_query".to_string()),
            };
        }

        if self.executed_queries.len() >= self.max_unique_queries {
            warn!(limit = self.max_unique_queries, "query limit reached");
            return ToolResult {
                name: "search_products".to_string(),
                response: json!({
                    "products": self.all_products,
                    "count": self.all_products.len(),
                    "status": "SEARCH_COMPLETE",
                    "instruction": format!(
                        "საძიებო ლიმიტი ამოიწურა. ნაპოვნია {} პროდუქტი. \
                         აღარ გამოიძახო search_products! დაწერე რეკომენდაცია \
                         ახლავე ამ პროდუქტების საფუძველზე.",
                        self.all_products.len()
                    ),
                }),
                products: self.all_products.clone(),
                skipped: true,
                skip_reason: Some("query_limit".to_string()),
            };
        }

        // Marked before the call so a failing search still consumes the slot.
        self.executed_queries.insert(query_key);

        match self.backend.search_products(&self.user_id, args).await {
            Ok(response) => {
                let products: Vec<serde_json::Value> = response
                    .get("products")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                if !products.is_empty() {
                    info!(
                        found = products.len(),
                        total = self.all_products.len() + products.len(),
                        "search found products"
                    );
                    self.all_products.extend(products.clone());
                }
                ToolResult {
                    name: "search_products".to_string(),
                    response,
                    products,
                    skipped: false,
                    skip_reason: None,
                }
            }
            Err(e) => {
                error!(error = %e, "search_products failed");
                ToolResult::error("search_products", e)
            }
        }
    }

    /// Served from the pre-cached profile — no I/O. Avoids a costly extra
    /// LLM round and sidesteps the provider's parallel-call signature
    /// validation on this tool.
    fn execute_get_profile(&self) -> ToolResult {
        info!(user = %self.user_id, "serving pre-cached profile");
        ToolResult::plain("get_user_profile", self.profile.clone())
    }

    async fn execute_update_profile(&mut self, args: &serde_json::Value) -> ToolResult {
        match self.backend.update_profile(&self.user_id, args).await {
            Ok(response) => {
                // Keep the in-request cache in step with the store.
                if let (Some(cache), Some(patch)) = (self.profile.as_object_mut(), args.as_object())
                {
                    for (k, v) in patch {
                        cache.insert(k.clone(), v.clone());
                    }
                }
                ToolResult::plain("update_user_profile", response)
            }
            Err(e) => {
                error!(error = %e, "update_user_profile failed");
                ToolResult::error("update_user_profile", e)
            }
        }
    }
}

/// The four tool schemas exposed to the LLM.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "search_products".to_string(),
            description: "მოძებნე პროდუქტები კატალოგში სემანტიკური ძიებით. \
                          გამოიყენე მომხმარებლის საჭიროების აღწერა query-ში."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "საძიებო ფრაზა" },
                    "max_price": { "type": "number", "description": "ფასის ზედა ზღვარი ლარებში" },
                    "category": { "type": "string", "description": "კატეგორია, მაგ. protein, creatine" }
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: "get_user_profile".to_string(),
            description: "წაიკითხე მომხმარებლის პროფილი (ალერგიები, მიზნები, პრეფერენციები)."
                .to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: "update_user_profile".to_string(),
            description: "შეინახე მომხმარებლის ახალი ფაქტი პროფილში (ასაკი, წონა, მიზანი, ალერგია)."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "age": { "type": "integer" },
                    "weight": { "type": "number" },
                    "allergies": { "type": "array", "items": { "type": "string" } },
                    "goals": { "type": "array", "items": { "type": "string" } },
                    "fitness_level": { "type": "string" }
                }
            }),
        },
        ToolDefinition {
            name: "get_product_details".to_string(),
            description: "მიიღე ერთი პროდუქტის სრული დეტალები id-ით.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "product_id": { "type": "string" }
                },
                "required": ["product_id"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Backend that records calls and returns scripted products.
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ToolBackend for FakeBackend {
        async fn search_products(
            &self,
            _user_id: &str,
            args: &serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            let query = args["query"].as_str().unwrap_or("").to_string();
            self.calls.lock().unwrap().push(query.clone());
            Ok(json!({
                "products": [
                    { "id": format!("{query}-1"), "name": format!("{query} product") }
                ],
                "count": 1
            }))
        }

        async fn update_profile(
            &self,
            _user_id: &str,
            args: &serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            Ok(json!({ "updated": args }))
        }

        async fn product_details(
            &self,
            args: &serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            match args["product_id"].as_str() {
                Some(id) => Ok(json!({ "id": id, "name": "Details" })),
                None => Err("product_id required".to_string()),
            }
        }
    }

    fn executor(backend: Arc<FakeBackend>, max_queries: usize) -> ToolExecutor {
        ToolExecutor::new("u1", json!({"name": "გიორგი"}), backend, max_queries)
    }

    fn search_call(query: &str) -> FunctionCall {
        FunctionCall {
            name: "search_products".to_string(),
            args: json!({ "query": query }),
        }
    }

    #[tokio::test]
    async fn duplicate_query_returns_cached_aggregate() {
        let backend = FakeBackend::new();
        let mut ex = executor(backend.clone(), 3);
        let first = ex.execute(&search_call("protein")).await;
        assert!(!first.skipped);
        assert_eq!(first.products.len(), 1);

        let second = ex.execute(&search_call("Protein")).await;
        assert!(second.skipped);
        assert_eq!(second.skip_reason.as_deref(), Some("duplicate_query"));
        assert_eq!(backend.call_count(), 1);
        assert_eq!(ex.unique_query_count(), 1);
    }

    #[tokio::test]
    async fn query_limit_returns_stop_directive() {
        let backend = FakeBackend::new();
        let mut ex = executor(backend.clone(), 1);
        let first = ex.execute(&search_call("protein")).await;
        assert!(!first.skipped);

        let second = ex.execute(&search_call("creatine")).await;
        assert!(second.skipped);
        assert_eq!(second.skip_reason.as_deref(), Some("query_limit"));
        assert_eq!(second.response["status"], "SEARCH_COMPLETE");
        assert!(!second.response["instruction"].as_str().unwrap().is_empty());

        // stays short-circuited
        let third = ex.execute(&search_call("bcaa")).await;
        assert_eq!(third.skip_reason.as_deref(), Some("query_limit"));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn batch_dedupes_search_but_runs_other_tools() {
        let backend = FakeBackend::new();
        let mut ex = executor(backend.clone(), 5);
        let calls = vec![
            search_call("protein"),
            FunctionCall {
                name: "get_user_profile".to_string(),
                args: json!({}),
            },
            search_call("creatine"),
        ];
        let results = ex.execute_batch(&calls, true).await;
        assert_eq!(results.len(), 3);
        assert!(!results[0].skipped);
        assert!(!results[1].skipped);
        assert!(results[2].skipped);
        assert_eq!(results[2].skip_reason.as_deref(), Some("batch_duplicate"));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn profile_is_served_from_cache() {
        let backend = FakeBackend::new();
        let mut ex = executor(backend.clone(), 3);
        let result = ex
            .execute(&FunctionCall {
                name: "get_user_profile".to_string(),
                args: json!({}),
            })
            .await;
        assert_eq!(result.response["name"], "გიორგი");
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn profile_update_refreshes_cache() {
        let backend = FakeBackend::new();
        let mut ex = executor(backend.clone(), 3);
        ex.execute(&FunctionCall {
            name: "update_user_profile".to_string(),
            args: json!({ "age": 30 }),
        })
        .await;
        let profile = ex
            .execute(&FunctionCall {
                name: "get_user_profile".to_string(),
                args: json!({}),
            })
            .await;
        assert_eq!(profile.response["age"], 30);
        assert_eq!(profile.response["name"], "გიორგი");
    }

    #[tokio::test]
    async fn backend_errors_are_captured_not_thrown() {
        let backend = FakeBackend::new();
        let mut ex = executor(backend, 3);
        let result = ex
            .execute(&FunctionCall {
                name: "get_product_details".to_string(),
                args: json!({}),
            })
            .await;
        assert!(result.response.get("error").is_some());
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_payload() {
        let backend = FakeBackend::new();
        let mut ex = executor(backend, 3);
        let result = ex
            .execute(&FunctionCall {
                name: "launch_rockets".to_string(),
                args: json!({}),
            })
            .await;
        assert!(result.response["error"]
            .as_str()
            .unwrap()
            .contains("launch_rockets"));
    }

    #[test]
    fn four_tools_are_defined() {
        let defs = tool_definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "search_products",
                "get_user_profile",
                "update_user_profile",
                "get_product_details"
            ]
        );
    }
}
