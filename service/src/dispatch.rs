//! Tool-call dispatcher.
//!
//! Routes JSON-RPC-lite methods to the [`CatalogStore`] and feeds one usage
//! event per completed call. `health/check` is answered before anything
//! else so it stays fast while mutations are in flight.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use instrux_catalog::{
    CatalogError, CatalogStore, CreateOutcome, ItemError, ListFilter, UsageAggregator,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::PROTOCOL_VERSION;
use crate::protocol::*;

pub const METHOD_HEALTH_CHECK: &str = "health/check";

/// Usage key for every method outside [`METHODS`].
pub const UNKNOWN_METHOD: &str = "unknown";

/// Every method the dispatcher answers, advertised by `hello`.
pub const METHODS: &[&str] = &[
    "hello",
    "health/check",
    "instructions/add",
    "instructions/import",
    "instructions/update",
    "instructions/remove",
    "instructions/groom",
    "instructions/dispatch",
    "instructions/governanceHash",
    "instructions/health",
    "instructions/export",
    "instructions/snapshot",
    "usage/track",
    "usage/hotset",
    "metrics/snapshot",
];

type RpcResult = Result<serde_json::Value, JsonRpcError>;

pub struct Dispatcher {
    store: Arc<CatalogStore>,
    usage: UsageAggregator,
    started_at: Instant,
    last_activity: Mutex<Instant>,
    connections: AtomicU32,
}

impl Dispatcher {
    pub fn new(store: Arc<CatalogStore>, usage: UsageAggregator) -> Self {
        let now = Instant::now();
        Self {
            store,
            usage,
            started_at: now,
            last_activity: Mutex::new(now),
            connections: AtomicU32::new(0),
        }
    }

    pub fn store(&self) -> &Arc<CatalogStore> {
        &self.store
    }

    pub fn usage(&self) -> &UsageAggregator {
        &self.usage
    }

    /// Service uptime in seconds.
    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last dispatched request.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Parse and dispatch a single JSON-RPC message.
    pub async fn dispatch_message(&self, raw: &str) -> serde_json::Value {
        let request: JsonRpcRequest = match serde_json::from_str(raw) {
            Ok(req) => req,
            Err(e) => {
                return error_response(
                    RequestId::Integer(0),
                    JsonRpcError::new(ERR_INVALID_REQUEST, format!("Invalid JSON-RPC: {e}")),
                );
            }
        };

        if request.method == METHOD_HEALTH_CHECK {
            return respond(request.id, self.handle_health_check());
        }

        self.touch();
        let started = Instant::now();
        let instruction_id = instruction_id_of(request.params.as_ref());
        let result = self.dispatch_method(&request.method, request.params).await;

        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        // Hits count only for successful requests; their id is in the catalog.
        let operation = usage_operation(&request.method);
        let hit = instruction_id.filter(|_| result.is_ok());
        self.usage
            .record(operation, hit.as_deref(), result.is_ok(), latency_ms);
        if let Err(e) = &result {
            tracing::debug!(method = %request.method, code = e.code, message = %e.message, "Request failed");
        }

        respond(request.id, result)
    }

    /// Dispatch to the appropriate handler based on method name.
    async fn dispatch_method(&self, method: &str, params: Option<serde_json::Value>) -> RpcResult {
        match method {
            "hello" => self.handle_hello(params),
            "instructions/add" => self.handle_add(params).await,
            "instructions/import" => self.handle_import(params).await,
            "instructions/update" => self.handle_update(params).await,
            "instructions/remove" => self.handle_remove(params).await,
            "instructions/groom" => self.handle_groom(params).await,
            "instructions/dispatch" => self.handle_dispatch(params),
            "instructions/governanceHash" => {
                to_result(self.store.governance_report().map_err(|e| catalog_error_to_rpc(&e))?)
            }
            "instructions/health" => to_result(self.store.health().await),
            "instructions/export" => self.handle_export(params),
            "instructions/snapshot" => self.handle_snapshot().await,
            "usage/track" => self.handle_track(params),
            "usage/hotset" => self.handle_hotset(params).await,
            "metrics/snapshot" => {
                self.usage.flush().await;
                to_result(self.usage.snapshot())
            }
            _ => Err(JsonRpcError::new(
                ERR_METHOD_NOT_FOUND,
                format!("Unknown method: {method}"),
            )),
        }
    }

    fn handle_health_check(&self) -> RpcResult {
        to_result(HealthCheckResult {
            status: "ok".to_string(),
            uptime_s: self.uptime_s(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Handle the `hello` handshake.
    fn handle_hello(&self, params: Option<serde_json::Value>) -> RpcResult {
        let hello: HelloParams = parse_params(params, "hello")?;

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(JsonRpcError::new(
                ERR_INVALID_PARAMS,
                format!(
                    "Incompatible protocol version: client={}, service={PROTOCOL_VERSION}",
                    hello.protocol_version
                ),
            ));
        }
        tracing::debug!(client_version = %hello.client_version, "Client handshake");

        to_result(HelloResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            mutation_enabled: self.store.mutation_enabled(),
            capabilities: METHODS.iter().map(|m| (*m).to_string()).collect(),
        })
    }

    // ── Mutations (run detached so they finish even if the client leaves) ──

    async fn handle_add(&self, params: Option<serde_json::Value>) -> RpcResult {
        let params: AddParams = parse_params(params, "instructions/add")?;
        let store = Arc::clone(&self.store);
        let outcome =
            run_detached(async move { store.create(params.entry, params.overwrite).await }).await?;

        to_result(AddResult {
            id: outcome.id().to_string(),
            created: matches!(outcome, CreateOutcome::Created(_)),
            overwritten: matches!(outcome, CreateOutcome::Overwritten(_)),
            skipped: matches!(outcome, CreateOutcome::Skipped { .. }),
            version: outcome.version().map(str::to_string),
            reason: outcome
                .conflict()
                .map(|e| ItemError::from_error(outcome.id(), &e)),
        })
    }

    async fn handle_import(&self, params: Option<serde_json::Value>) -> RpcResult {
        let params: ImportParams = parse_params(params, "instructions/import")?;
        let store = Arc::clone(&self.store);
        to_result(
            run_detached(async move { store.import(params.entries, params.overwrite).await })
                .await?,
        )
    }

    async fn handle_update(&self, params: Option<serde_json::Value>) -> RpcResult {
        let params: UpdateParams = parse_params(params, "instructions/update")?;
        let store = Arc::clone(&self.store);
        to_result(run_detached(async move { store.update(params.entry).await }).await?)
    }

    async fn handle_remove(&self, params: Option<serde_json::Value>) -> RpcResult {
        let params: RemoveParams = parse_params(params, "instructions/remove")?;
        let store = Arc::clone(&self.store);
        to_result(
            run_detached(async move { store.remove(&params.ids, params.missing_ok).await }).await?,
        )
    }

    async fn handle_groom(&self, params: Option<serde_json::Value>) -> RpcResult {
        let params: GroomParams = parse_params_or_default(params, "instructions/groom")?;
        let store = Arc::clone(&self.store);
        to_result(run_detached(async move { store.groom(params.mode).await }).await?)
    }

    async fn handle_snapshot(&self) -> RpcResult {
        let store = Arc::clone(&self.store);
        to_result(run_detached(async move { store.write_snapshot().await }).await?)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    fn handle_dispatch(&self, params: Option<serde_json::Value>) -> RpcResult {
        let value = params
            .ok_or_else(|| JsonRpcError::new(ERR_INVALID_PARAMS, "Missing params"))?;
        let selector: DispatchAction = from_value(value.clone(), "instructions/dispatch")?;
        let rpc = |e: CatalogError| catalog_error_to_rpc(&e);

        match selector.action.as_str() {
            "list" => {
                let filter: ListFilter = from_value(value, "list")?;
                to_result(ItemsResult::from(self.store.list(&filter).map_err(rpc)?))
            }
            "get" => {
                let p: GetParams = from_value(value, "get")?;
                to_result(self.store.get(&p.id).map_err(rpc)?)
            }
            "search" => {
                let p: SearchParams = from_value(value, "search")?;
                to_result(ItemsResult::from(self.store.search(&p.q, p.limit).map_err(rpc)?))
            }
            "categories" => to_result(ItemsResult::from(self.store.categories())),
            "audit" => to_result(self.store.audit()),
            other => Err(JsonRpcError::new(
                ERR_INVALID_PARAMS,
                format!("Unknown dispatch action: {other} (expected list|get|search|categories|audit)"),
            )),
        }
    }

    fn handle_export(&self, params: Option<serde_json::Value>) -> RpcResult {
        let params: ExportParams = parse_params_or_default(params, "instructions/export")?;
        to_result(
            self.store
                .export(params.summary)
                .map_err(|e| catalog_error_to_rpc(&e))?,
        )
    }

    fn handle_track(&self, params: Option<serde_json::Value>) -> RpcResult {
        let params: TrackParams = parse_params(params, "usage/track")?;
        if params.id.trim().is_empty() {
            return Err(JsonRpcError::new(ERR_INVALID_PARAMS, "id must not be empty"));
        }
        self.store
            .get(&params.id)
            .map_err(|e| catalog_error_to_rpc(&e))?;
        // The hit itself is the usage event recorded by dispatch_message.
        to_result(TrackResult { tracked: true })
    }

    async fn handle_hotset(&self, params: Option<serde_json::Value>) -> RpcResult {
        let params: HotsetParams = parse_params_or_default(params, "usage/hotset")?;
        // Earlier requests on this connection are still in the channel.
        self.usage.flush().await;
        to_result(serde_json::json!({ "items": self.usage.hotset(params.limit) }))
    }
}

/// Run a mutation on its own task; the write completes even if the caller's
/// future is dropped.
async fn run_detached<F, T>(fut: F) -> Result<T, JsonRpcError>
where
    F: Future<Output = instrux_catalog::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .unwrap_or_else(|e| Err(CatalogError::internal(format!("mutation task failed: {e}"))))
        .map_err(|e| catalog_error_to_rpc(&e))
}

fn usage_operation(method: &str) -> &str {
    METHODS
        .iter()
        .copied()
        .find(|m| *m == method)
        .unwrap_or(UNKNOWN_METHOD)
}

/// Instruction id a request refers to, if any (`params.id` or `params.entry.id`).
fn instruction_id_of(params: Option<&serde_json::Value>) -> Option<String> {
    let params = params?;
    params
        .get("id")
        .or_else(|| params.get("entry").and_then(|e| e.get("id")))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

fn parse_params<T: DeserializeOwned>(
    params: Option<serde_json::Value>,
    method: &str,
) -> Result<T, JsonRpcError> {
    params
        .ok_or_else(|| JsonRpcError::new(ERR_INVALID_PARAMS, "Missing params"))
        .and_then(|v| from_value(v, method))
}

fn parse_params_or_default<T: DeserializeOwned + Default>(
    params: Option<serde_json::Value>,
    method: &str,
) -> Result<T, JsonRpcError> {
    match params {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(v) => from_value(v, method),
    }
}

fn from_value<T: DeserializeOwned>(value: serde_json::Value, what: &str) -> Result<T, JsonRpcError> {
    serde_json::from_value(value)
        .map_err(|e| JsonRpcError::new(ERR_INVALID_PARAMS, format!("Invalid {what} params: {e}")))
}

fn to_result<T: Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcError::new(ERR_INTERNAL, format!("Serialize error: {e}")))
}

fn respond(id: RequestId, result: RpcResult) -> serde_json::Value {
    match result {
        Ok(value) => serde_json::to_value(JsonRpcResponse { id, result: value }).unwrap_or_default(),
        Err(error) => error_response(id, error),
    }
}

fn error_response(id: RequestId, error: JsonRpcError) -> serde_json::Value {
    serde_json::to_value(JsonRpcErrorResponse { id, error }).unwrap_or_default()
}

/// Map a catalog error onto its JSON-RPC code.
pub fn catalog_error_to_rpc(err: &CatalogError) -> JsonRpcError {
    match err {
        CatalogError::NotFound { .. } => JsonRpcError::new(ERR_NOT_FOUND, err.to_string()),
        CatalogError::ValidationFailed { reasons, .. } => {
            JsonRpcError::new(ERR_VALIDATION, err.to_string())
                .with_data(serde_json::json!({ "reasons": reasons }))
        }
        CatalogError::Conflict { .. } => JsonRpcError::new(ERR_INVALID_PARAMS, err.to_string()),
        CatalogError::MutationDisabled => {
            JsonRpcError::new(ERR_MUTATION_DISABLED, err.to_string())
        }
        CatalogError::IntegrityMismatch { .. } => {
            JsonRpcError::new(ERR_INTEGRITY, err.to_string())
        }
        CatalogError::CorruptedRecord { .. }
        | CatalogError::Io { .. }
        | CatalogError::Serialization(_) => JsonRpcError::new(ERR_IO, err.to_string()),
        CatalogError::Config { .. } | CatalogError::Internal { .. } => {
            JsonRpcError::new(ERR_INTERNAL, err.to_string())
        }
    }
}
