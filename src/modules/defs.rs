use anyhow::Result;
use bitcoin::{Block, OutPoint};
use futures::future::BoxFuture;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

/// Object-safe handler: JSON params -> JSON result (async)
type HandlerFn = dyn Fn(Value) -> BoxFuture<'static, Value> + Send + Sync;

/// Shared registry of RPC handlers (method name -> handler)
#[derive(Clone, Default)]
pub struct RpcRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<HandlerFn>>>>,
}

impl RpcRegistry {
    pub async fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Value> + Send + 'static,
    {
        let name = name.into();
        let arc: Arc<HandlerFn> = Arc::new(move |val| Box::pin(f(val)));
        self.inner.write().await.insert(name, arc);
    }

    pub async fn has_method(&self, name: &str) -> bool {
        self.inner.read().await.contains_key(name)
    }

    pub async fn call(&self, method: &str, payload: Value) -> Value {
        match self.inner.read().await.get(method) {
            Some(h) => h(payload).await,
            None => serde_json::json!({ "ok": false, "error": format!("unknown method: {method}") }),
        }
    }
}

/// Object-safe index-module interface (storable as dyn). A module owns a
/// namespace of the shared database and keeps it consistent with the chain
/// through the connect/disconnect pair.
pub trait IndexModule: Send + Sync {
    fn get_name(&self) -> &'static str;

    /// Run startup work (schema migrations, background tasks). A module that
    /// fails here must be treated as unusable.
    fn init(&self) -> Result<()>;

    fn connect_block(&self, block: &Block, height: i32) -> Result<()>;
    fn disconnect_block(&self, block: &Block) -> Result<()>;

    /// Register this module's RPC methods on the shared router.
    fn register_rpc(&self, reg: &RpcRegistry);

    /// Stop background tasks and release resources.
    fn shutdown(&self);
}

/// Simple registry that holds modules and the RPC router
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn IndexModule>>,
    pub router: RpcRegistry,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self { modules: Vec::new(), router: RpcRegistry::default() }
    }

    pub fn register_module<M>(&mut self, module: M)
    where
        M: IndexModule + 'static,
    {
        let m = Arc::new(module);
        // Allow module to register its RPC handlers into the single router:
        m.register_rpc(&self.router);
        self.modules.push(m);
    }

    pub fn modules(&self) -> &[Arc<dyn IndexModule>] {
        &self.modules
    }

    pub fn init_all(&self) -> Result<()> {
        for m in &self.modules {
            m.init()?;
        }
        Ok(())
    }

    pub fn connect_block(&self, block: &Block, height: i32) -> Result<()> {
        for m in &self.modules {
            m.connect_block(block, height)?;
        }
        Ok(())
    }

    pub fn disconnect_block(&self, block: &Block) -> Result<()> {
        for m in &self.modules {
            m.disconnect_block(block)?;
        }
        Ok(())
    }

    pub fn shutdown_all(&self) {
        for m in &self.modules {
            m.shutdown();
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the pruner learns the current chain height.
pub trait ChainTipSource: Send + Sync {
    fn current_tip_height(&self) -> i32;
}

/// Unconfirmed-spend oracle consulted by the RPC layer. Index entries under
/// the open family are candidates; offers spent in the mempool are hidden
/// from open results and surfaced as pending history.
pub trait MempoolView: Send + Sync {
    fn is_spent(&self, outpoint: &OutPoint) -> bool;
}

/// Stand-in when no mempool source is wired: nothing is ever filtered.
pub struct NullMempool;

impl MempoolView for NullMempool {
    fn is_spent(&self, _outpoint: &OutPoint) -> bool {
        false
    }
}
