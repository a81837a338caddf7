//! Runtime assembly and lifecycle.
//!
//! Builds every service from configuration and collaborator providers,
//! wires the agent graph, starts the scheduler and the queue consumers,
//! and coordinates graceful shutdown. Nothing here is a global: services
//! are constructed once and passed into the components that need them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::{
    KnowledgeAgent, LoadContextNode, MainAgentNode, NotificationCollectorNode, PlanNode,
    ToolLoopNode,
};
use crate::budget::DailyBudget;
use crate::config::{Config, RuntimePaths};
use crate::integrity::IntegrityChecker;
use crate::kernel::graph::{Graph, GraphBuilder, GraphCtx};
use crate::kernel::planner::Planner;
use crate::kernel::{Kernel, KernelResponse};
use crate::memory::vector::{Embedder, HashEmbedder, InMemoryVectorStore, VectorStore};
use crate::memory::MemoryManager;
use crate::notify::NotificationCenter;
use crate::pollers::calendar::CalendarWatcher;
use crate::pollers::email::EmailPoller;
use crate::pollers::health::{HealthProbe, ProbeHealth, ServiceHealthAgent};
use crate::pollers::{CalendarProvider, EmailProvider};
use crate::providers::offline::OfflineModel;
use crate::providers::LanguageModel;
use crate::queue::{QueueStats, TaskQueue};
use crate::scheduler::ScheduledTaskManager;
use crate::session::SessionRegistry;
use crate::store::Store;
use crate::tools::builtin::{
    BrowserSnapshotTool, EmailSummaryTool, MemorySaveTool, MemorySearchTool, SearchProvider,
    SnapshotProvider, WebFetchTool, WebSearchTool,
};
use crate::tools::invoker::ToolInvoker;
use crate::tools::remote::{register_server_tools, HttpToolServer, ToolServer};
use crate::tools::ToolRegistry;
use crate::types::{Priority, ServiceKind, TaskStatus};
use crate::workers::WorkerPool;

/// Parallel queue consumers.
const QUEUE_CONSUMERS: usize = 2;

/// Collaborator implementations injected by the transport layer. Every
/// field has a local default so the runtime can boot without external
/// services.
pub struct Providers {
    /// Language model; defaults to the offline fallback.
    pub model: Arc<dyn LanguageModel>,
    /// Embedder; defaults to the token-hash embedder.
    pub embedder: Arc<dyn Embedder>,
    /// Vector store; defaults to the in-process store.
    pub vectors: Arc<dyn VectorStore>,
    /// Web search backend, if any.
    pub search: Option<Arc<dyn SearchProvider>>,
    /// Browser snapshot backend, if any.
    pub snapshots: Option<Arc<dyn SnapshotProvider>>,
    /// Email provider for the poller, if any.
    pub email: Option<Arc<dyn EmailProvider>>,
    /// Calendar provider for the watcher, if any.
    pub calendar: Option<Arc<dyn CalendarProvider>>,
    /// External tool servers to register at startup.
    pub tool_servers: Vec<Arc<dyn ToolServer>>,
    /// Operator `(tenant, user)` receiving service-health notifications.
    pub health_owner: Option<(Uuid, Uuid)>,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            model: Arc::new(OfflineModel),
            embedder: Arc::new(HashEmbedder::default()),
            vectors: Arc::new(InMemoryVectorStore::new()),
            search: None,
            snapshots: None,
            email: None,
            calendar: None,
            tool_servers: Vec::new(),
            health_owner: None,
        }
    }
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("model", &self.model.model_id())
            .finish_non_exhaustive()
    }
}

/// The assembled, running system.
pub struct Runtime {
    /// Structured store, shared with the transport layer.
    pub store: Arc<Store>,
    /// Memory manager.
    pub memory: Arc<MemoryManager>,
    /// Priority task queue.
    pub queue: Arc<TaskQueue>,
    /// Notification center.
    pub notify: Arc<NotificationCenter>,
    /// The orchestration kernel.
    pub kernel: Arc<Kernel>,
    workers: Arc<WorkerPool>,
    shutdown_tx: watch::Sender<bool>,
    scheduler_handle: tokio::task::JoinHandle<()>,
    consumer_handles: Vec<tokio::task::JoinHandle<()>>,
    handler_timeout: Duration,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    /// Build and start the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be opened or a tool server
    /// registration fails fatally.
    pub async fn start(
        config: &Config,
        paths: &RuntimePaths,
        providers: Providers,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(
            Store::open(&paths.db_path)
                .await
                .context("failed to open the structured store")?,
        );
        Self::start_with_store(config, paths, providers, store).await
    }

    /// Build and start the runtime over an already-open store (used by
    /// tests with an in-memory database).
    ///
    /// # Errors
    ///
    /// Returns an error when service assembly fails.
    pub async fn start_with_store(
        config: &Config,
        paths: &RuntimePaths,
        providers: Providers,
        store: Arc<Store>,
    ) -> anyhow::Result<Self> {
        let memory = Arc::new(MemoryManager::new(
            store.clone(),
            providers.vectors.clone(),
            providers.embedder.clone(),
            config.memory.hybrid_alpha,
            config.memory.medium_ttl_days,
            config.memory.short_term_window,
        ));
        let queue = Arc::new(TaskQueue::new(
            config.queue.soft_cap,
            config.queue.lease_secs,
        ));
        let notify = Arc::new(NotificationCenter::new(store.clone()));
        let budget = Arc::new(DailyBudget::new(config.budget.max_tokens_per_day));

        // Tool registry, in precedence order: built-ins first (they win
        // name collisions), then integration-backed tools, then tool-server
        // discoveries.
        let mut registry = ToolRegistry::new();
        if let Some(search) = &providers.search {
            registry.register(Arc::new(WebSearchTool::new(search.clone())));
        }
        registry.register(Arc::new(WebFetchTool::new()));
        if let Some(snapshots) = &providers.snapshots {
            registry.register(Arc::new(BrowserSnapshotTool::new(snapshots.clone())));
        }
        if let Some(email) = &providers.email {
            registry.register(Arc::new(EmailSummaryTool::new(store.clone(), email.clone())));
        }
        registry.register(Arc::new(MemorySearchTool::new(memory.clone())));
        registry.register(Arc::new(MemorySaveTool::new(memory.clone())));

        // Tool servers the users connected as integrations.
        for tenant in store.list_active_tenants().await? {
            let integrations = store
                .list_enabled_integrations(tenant.id, ServiceKind::ToolServer)
                .await?;
            for integration in integrations {
                let Some(url) = integration
                    .metadata
                    .get("server_url")
                    .and_then(|u| u.as_str())
                else {
                    continue;
                };
                let name = integration
                    .metadata
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("tools");
                let auth = (!integration.encrypted_credentials.is_empty())
                    .then(|| integration.encrypted_credentials.clone());
                match HttpToolServer::new(name, url) {
                    Ok(server) => {
                        if let Err(err) =
                            register_server_tools(&mut registry, Arc::new(server), auth).await
                        {
                            warn!(server = name, error = %err, "integration tool server skipped");
                        }
                    }
                    Err(err) => {
                        warn!(server = name, error = %err, "invalid tool server integration");
                    }
                }
            }
        }

        // Tool servers injected directly by the transport layer.
        for server in &providers.tool_servers {
            if let Err(err) = register_server_tools(&mut registry, server.clone(), None).await {
                warn!(server = server.server_name(), error = %err, "tool server skipped");
            }
        }
        let registry = Arc::new(registry);

        let invoker = Arc::new(ToolInvoker::new(
            registry.clone(),
            memory.clone(),
            config.tools.default_timeout_secs,
            config.tools.max_timeout_secs,
            config.tools.max_attempts,
        ));

        let integrity = Arc::new(IntegrityChecker::new(
            memory.clone(),
            providers.model.clone(),
            queue.clone(),
            notify.clone(),
            budget.clone(),
        ));
        let knowledge = Arc::new(KnowledgeAgent::new(
            providers.model.clone(),
            memory.clone(),
            integrity,
            budget,
        ));

        let workers = Arc::new(WorkerPool::new(config.runtime.worker_cap));
        let ctx = GraphCtx {
            workers: workers.clone(),
        };

        let graph = build_graph(
            memory.clone(),
            Arc::new(Planner::new(providers.model.clone())),
            registry,
            invoker,
            providers.model.clone(),
            notify.clone(),
        )?;

        let sessions = Arc::new(SessionRegistry::new());
        let kernel = Arc::new(Kernel::new(
            store.clone(),
            memory.clone(),
            sessions,
            notify.clone(),
            knowledge,
            graph,
            ctx,
            Duration::from_secs(config.runtime.request_timeout_secs),
        ));

        // Scheduler with the pollers that have providers.
        let mut scheduler = ScheduledTaskManager::new(
            queue.clone(),
            Duration::from_secs(config.scheduler.tick_secs),
            Duration::from_secs(config.scheduler.handler_timeout_secs),
        );
        if let Some(email) = &providers.email {
            scheduler.register(Arc::new(EmailPoller::new(
                store.clone(),
                email.clone(),
                Duration::from_secs(config.pollers.email_interval_secs),
                config.pollers.urgency_tokens.clone(),
            )));
        }
        if let Some(calendar) = &providers.calendar {
            scheduler.register(Arc::new(CalendarWatcher::new(
                store.clone(),
                calendar.clone(),
                Duration::from_secs(config.pollers.calendar_interval_secs),
            )));
        }
        let mut health = ServiceHealthAgent::new(
            queue.clone(),
            Duration::from_secs(config.pollers.health_interval_secs),
            Some(paths.health_json.clone()),
            providers.health_owner,
        );
        health.register(Arc::new(QueueDepthProbe {
            queue: queue.clone(),
            soft_cap: config.queue.soft_cap,
        }));
        health.register(Arc::new(StoreProbe {
            store: store.clone(),
        }));
        scheduler.register(Arc::new(health));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

        // Queue consumers routing background tasks through the kernel.
        let mut consumer_handles = Vec::with_capacity(QUEUE_CONSUMERS);
        for consumer_id in 0..QUEUE_CONSUMERS {
            let queue = queue.clone();
            let kernel = kernel.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            consumer_handles.push(tokio::spawn(async move {
                loop {
                    let task = tokio::select! {
                        task = queue.dequeue() => task,
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                            continue;
                        }
                    };

                    let status = match kernel.handle_task(&task).await {
                        Ok(status) => status,
                        Err(err) => {
                            warn!(consumer_id, task_id = %task.id, error = %err, "task failed");
                            TaskStatus::Failed
                        }
                    };
                    if let Err(err) = queue.complete(task.id, status) {
                        warn!(consumer_id, task_id = %task.id, error = %err, "task completion failed");
                    }
                }
                info!(consumer_id, "queue consumer stopped");
            }));
        }

        info!("runtime started");
        Ok(Self {
            store,
            memory,
            queue,
            notify,
            kernel,
            workers,
            shutdown_tx,
            scheduler_handle,
            consumer_handles,
            handler_timeout: Duration::from_secs(config.scheduler.handler_timeout_secs),
        })
    }

    /// Handle a user message (transport entry point).
    ///
    /// # Errors
    ///
    /// See [`Kernel::handle_message`].
    pub async fn handle_message(
        &self,
        tenant_id: Uuid,
        session_id: Uuid,
        text: &str,
        force_web_search: bool,
    ) -> anyhow::Result<KernelResponse> {
        self.kernel
            .handle_message(tenant_id, session_id, text, force_web_search)
            .await
    }

    /// Queue statistics for observability endpoints.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Gracefully stop: signal shutdown, join the scheduler and the
    /// consumers, drain the worker pool.
    pub async fn shutdown(self) {
        info!("runtime shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Err(err) = self.scheduler_handle.await {
            warn!(error = %err, "scheduler join failed");
        }
        for handle in self.consumer_handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "consumer join failed");
            }
        }
        self.workers.shutdown(self.handler_timeout).await;
        info!("runtime stopped");
    }
}

/// Wire the request graph:
///
/// ```text
/// load_context -> planner -> tool_loop -> main_agent -> respond
///                        \______________/^ (only when a plan exists)
/// ```
fn build_graph(
    memory: Arc<MemoryManager>,
    planner: Arc<Planner>,
    registry: Arc<ToolRegistry>,
    invoker: Arc<ToolInvoker>,
    model: Arc<dyn LanguageModel>,
    notify: Arc<NotificationCenter>,
) -> anyhow::Result<Graph> {
    GraphBuilder::new()
        .node(Arc::new(LoadContextNode::new(memory)))
        .node(Arc::new(PlanNode::new(planner, registry)))
        .node(Arc::new(ToolLoopNode::new(invoker)))
        .node(Arc::new(MainAgentNode::new(model)))
        .node(Arc::new(NotificationCollectorNode::new(notify)))
        .edge("load_context", "planner")
        .edge_if("planner", "tool_loop", |state| state.plan.is_some())
        .edge("planner", "main_agent")
        .edge("tool_loop", "main_agent")
        .edge("main_agent", "respond")
        .entry("load_context")
        .terminal("respond")
        .build()
        .context("agent graph wiring is invalid")
}

/// Degrades when the queue approaches its soft cap.
struct QueueDepthProbe {
    queue: Arc<TaskQueue>,
    soft_cap: usize,
}

#[async_trait::async_trait]
impl HealthProbe for QueueDepthProbe {
    fn id(&self) -> &'static str {
        "task_queue"
    }

    fn resource(&self) -> &'static str {
        "priority task queue"
    }

    fn severity(&self) -> Priority {
        Priority::High
    }

    async fn check(&self) -> ProbeHealth {
        let pending = self.queue.stats().pending;
        if pending >= self.soft_cap {
            ProbeHealth::Unhealthy
        } else if pending.saturating_mul(2) >= self.soft_cap {
            ProbeHealth::Degraded
        } else {
            ProbeHealth::Healthy
        }
    }
}

/// Pings the structured store with a trivial query.
struct StoreProbe {
    store: Arc<Store>,
}

#[async_trait::async_trait]
impl HealthProbe for StoreProbe {
    fn id(&self) -> &'static str {
        "store"
    }

    fn resource(&self) -> &'static str {
        "sqlite store"
    }

    fn severity(&self) -> Priority {
        Priority::Critical
    }

    async fn check(&self) -> ProbeHealth {
        match self.store.list_active_tenants().await {
            Ok(_) => ProbeHealth::Healthy,
            Err(_) => ProbeHealth::Unhealthy,
        }
    }
}
