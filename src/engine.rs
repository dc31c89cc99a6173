//! The `Trove` facade: one project store, the optional global store, the
//! embedding provider and its worker pool, behind an async API.
//!
//! Store calls are synchronous SQLite work and run on the blocking pool.
//! Cross-store propagation happens after the project write commits; a failed
//! sync is logged and never fails the caller's write.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::activity::{self, Activity, ActivityFilter, NewActivity, TimelineGroup, TimelineGrouping};
use crate::config::TroveConfig;
use crate::db::migrations::{get_embedding_model, set_embedding_model};
use crate::db::{check_database_health, Database, HealthReport, StoreOptions};
use crate::embedding::worker::{EmbeddingJob, EmbeddingWorkers};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{TroveError, TroveResult};
use crate::memory::relations::{self, Neighbor, RelationType, Relationship};
use crate::memory::review::{self, ReviewAction};
use crate::memory::search::{self, QueryVector, SearchMode, SearchRequest, SearchResponse};
use crate::memory::stats::{self, ProjectStats, TagUsage};
use crate::memory::store::{self, embedding_text};
use crate::memory::types::{Memory, MemoryFilter, MemoryUpdate, NewMemory, SortOrder};
use crate::session::{self, ContextFlags, Session, SessionStart, SessionSummary};
use crate::sync::{self, GlobalStats, SyncReport};

struct Inner {
    project_path: String,
    project: Arc<Database>,
    global: Option<Arc<Database>>,
    config: TroveConfig,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    workers: Mutex<Option<EmbeddingWorkers>>,
    /// Session that new memories and activities are attributed to.
    current_session: Mutex<Option<String>>,
}

/// Cheap to clone; clones share the same stores.
#[derive(Clone)]
pub struct Trove {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Trove {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trove")
            .field("project_path", &self.inner.project_path)
            .field("project", &self.inner.project)
            .field("global", &self.inner.global)
            .finish()
    }
}

fn join_error(e: tokio::task::JoinError) -> TroveError {
    TroveError::Io(std::io::Error::other(e.to_string()))
}

impl Trove {
    /// Open the store under `project_path` (and the global store when sync is
    /// enabled) using `config`. Background embedding workers start only when
    /// a provider is configured and a tokio runtime is running.
    pub fn open(config: TroveConfig, project_path: impl AsRef<Path>) -> TroveResult<Self> {
        let project_path = project_path.as_ref();
        let options = StoreOptions::from_config(&config);
        let project = Database::open(config.project_db_path(project_path), options.clone())?;
        let global = if config.sync.global_sync_enabled {
            Some(Database::open(config.resolved_global_db_path(), options)?)
        } else {
            None
        };
        let provider = create_provider(&config.embedding)?;
        Self::with_stores(config, project_path, project, global, provider)
    }

    /// Assemble from already-open stores.
    pub fn with_stores(
        config: TroveConfig,
        project_path: impl Into<PathBuf>,
        project: Database,
        global: Option<Database>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> TroveResult<Self> {
        let project = Arc::new(project);
        let global = global.map(Arc::new);

        if let Some(provider) = &provider {
            for db in std::iter::once(&project).chain(global.as_ref()) {
                check_embedding_model(db, provider.as_ref())?;
            }
        }

        let workers = match (&provider, tokio::runtime::Handle::try_current()) {
            (Some(provider), Ok(_)) => Some(EmbeddingWorkers::spawn(
                Arc::clone(&project),
                Arc::clone(provider),
                config.embedding.workers,
                config.embedding.queue_capacity,
            )),
            (Some(_), Err(_)) => {
                tracing::warn!("no tokio runtime, background embedding disabled");
                None
            }
            (None, _) => None,
        };

        let project_path: PathBuf = project_path.into();
        let project_path = project_path.to_string_lossy().into_owned();
        tracing::info!(
            project = %project_path,
            global = global.is_some(),
            embeddings = provider.is_some(),
            "trove ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                project_path,
                project,
                global,
                config,
                provider,
                workers: Mutex::new(workers),
                current_session: Mutex::new(None),
            }),
        })
    }

    pub fn project_path(&self) -> &str {
        &self.inner.project_path
    }

    pub fn config(&self) -> &TroveConfig {
        &self.inner.config
    }

    pub fn project_store(&self) -> &Arc<Database> {
        &self.inner.project
    }

    pub fn global_store(&self) -> Option<&Arc<Database>> {
        self.inner.global.as_ref()
    }

    /// Session currently attributed to new records, if any.
    pub fn current_session(&self) -> Option<String> {
        self.inner
            .current_session
            .lock()
            .ok()
            .and_then(|s| s.clone())
    }

    async fn blocking<T, F>(&self, f: F) -> TroveResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> TroveResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(join_error)?
    }

    // --- memories ---

    /// Store a new memory. Returns after the project write commits and the
    /// global copy (if enabled) has been attempted.
    pub async fn remember(&self, mut new: NewMemory) -> TroveResult<Memory> {
        if new.source_session_id.is_none() {
            new.source_session_id = self.current_session();
        }
        let memory = self
            .blocking(move |inner| {
                let dim = inner.project.embedding_dim();
                inner
                    .project
                    .write(|tx| store::create_memory(tx, &new, dim, Utc::now()))
            })
            .await?;

        self.queue_embedding(&memory);
        self.sync_committed(&memory).await;
        Ok(memory)
    }

    pub async fn get(&self, id: &str) -> TroveResult<Memory> {
        let id = id.to_string();
        self.blocking(move |inner| inner.project.read(|conn| store::get_memory(conn, &id)))
            .await
    }

    pub async fn list(
        &self,
        filter: MemoryFilter,
        sort: SortOrder,
        limit: usize,
        offset: usize,
    ) -> TroveResult<Vec<Memory>> {
        self.blocking(move |inner| {
            inner
                .project
                .read(|conn| store::list_memories(conn, &filter, sort, limit, offset))
        })
        .await
    }

    pub async fn update(&self, id: &str, update: MemoryUpdate) -> TroveResult<Memory> {
        let id = id.to_string();
        let memory = self
            .blocking(move |inner| {
                let dim = inner.project.embedding_dim();
                inner
                    .project
                    .write(|tx| store::update_memory(tx, &id, &update, dim, Utc::now()))
            })
            .await?;

        self.queue_embedding(&memory);
        self.sync_committed(&memory).await;
        Ok(memory)
    }

    /// Hard-delete a memory. `confirm` must be true.
    pub async fn forget(&self, id: &str, confirm: bool) -> TroveResult<()> {
        if !confirm {
            return Err(TroveError::validation("deleting a memory requires confirm=true"));
        }
        if let Ok(workers) = self.inner.workers.lock() {
            if let Some(workers) = workers.as_ref() {
                workers.cancel(id);
            }
        }

        let owned = id.to_string();
        self.blocking(move |inner| inner.project.write(|tx| store::delete_memory(tx, &owned)))
            .await?;

        if self.inner.config.sync.global_sync_enabled {
            let owned = id.to_string();
            let removed = self
                .blocking(move |inner| match &inner.global {
                    Some(global) => global.write(|tx| {
                        sync::remove_global_entry(tx, &inner.project_path, &owned)
                    }),
                    None => Ok(false),
                })
                .await;
            if let Err(e) = removed {
                tracing::warn!(memory_id = %id, error = %e, "global copy not removed");
            }
        }
        Ok(())
    }

    /// Search the project store and record the recall on every hit.
    pub async fn search(&self, mut request: SearchRequest) -> TroveResult<SearchResponse> {
        if request.limit == 0 {
            request.limit = self.inner.config.search.default_limit;
        }
        let vector = self.query_vector(&request.query, request.mode).await;
        let response = self
            .blocking(move |inner| {
                inner.project.read(|conn| {
                    search::search(
                        conn,
                        &request,
                        &vector,
                        &inner.config.ranking,
                        &inner.config.search,
                        Utc::now(),
                    )
                })
            })
            .await?;

        let ids = response.hit_ids();
        if !ids.is_empty() {
            let bumped = self
                .blocking(move |inner| {
                    inner
                        .project
                        .write(|tx| store::record_access(tx, &ids, Utc::now()))
                })
                .await;
            if let Err(e) = bumped {
                tracing::warn!(error = %e, "access not recorded");
            }
        }
        Ok(response)
    }

    /// Search with the configured default mode.
    pub async fn recall(&self, query: &str, limit: usize) -> TroveResult<SearchResponse> {
        let mut request = SearchRequest::new(query, self.inner.config.search.default_search_mode);
        request.limit = limit;
        self.search(request).await
    }

    pub async fn list_tags(&self, min_count: i64, limit: usize) -> TroveResult<Vec<TagUsage>> {
        self.blocking(move |inner| inner.project.read(|conn| stats::list_tags(conn, min_count, limit)))
            .await
    }

    pub async fn stats(&self) -> TroveResult<ProjectStats> {
        self.blocking(|inner| {
            let path = inner.project.path().map(Path::to_path_buf);
            inner
                .project
                .read(|conn| stats::project_stats(conn, path.as_deref()))
        })
        .await
    }

    pub async fn health(&self) -> TroveResult<HealthReport> {
        self.blocking(|inner| inner.project.read(check_database_health))
            .await
    }

    // --- relationships ---

    pub async fn link(
        &self,
        source_id: &str,
        target_id: &str,
        relation_type: RelationType,
        strength: Option<f64>,
    ) -> TroveResult<Relationship> {
        let (source, target) = (source_id.to_string(), target_id.to_string());
        self.blocking(move |inner| {
            inner.project.write(|tx| {
                relations::link(tx, &source, &target, relation_type, strength, Utc::now())
            })
        })
        .await
    }

    pub async fn unlink(
        &self,
        source_id: &str,
        target_id: &str,
        relation_type: RelationType,
    ) -> TroveResult<bool> {
        let (source, target) = (source_id.to_string(), target_id.to_string());
        self.blocking(move |inner| {
            inner
                .project
                .write(|tx| relations::unlink(tx, &source, &target, relation_type))
        })
        .await
    }

    /// Memories reachable from `memory_id` within `depth` hops.
    pub async fn related(&self, memory_id: &str, depth: usize) -> TroveResult<Vec<Neighbor>> {
        let id = memory_id.to_string();
        self.blocking(move |inner| inner.project.read(|conn| relations::neighbors(conn, &id, depth)))
            .await
    }

    /// Edges touching `memory_id` directly.
    pub async fn relationships(&self, memory_id: &str) -> TroveResult<Vec<Relationship>> {
        let id = memory_id.to_string();
        self.blocking(move |inner| inner.project.read(|conn| relations::edges_for(conn, &id)))
            .await
    }

    // --- activities ---

    /// Append to the audit log. Payloads are redacted and truncated, never
    /// rejected.
    pub async fn log_activity(&self, mut new: NewActivity) -> TroveResult<Activity> {
        if new.session_id.is_none() {
            new.session_id = self.current_session();
        }
        self.blocking(move |inner| {
            let max = inner.config.activity.max_output_truncation;
            inner.project.write(|tx| {
                activity::log_activity(tx, &inner.project_path, &new, max, Utc::now())
            })
        })
        .await
    }

    pub async fn activities(
        &self,
        filter: ActivityFilter,
        limit: usize,
        offset: usize,
    ) -> TroveResult<Vec<Activity>> {
        self.blocking(move |inner| {
            inner
                .project
                .read(|conn| activity::list_activities(conn, &filter, limit, offset))
        })
        .await
    }

    pub async fn timeline(
        &self,
        hours: u32,
        grouping: TimelineGrouping,
        include_activities: bool,
        include_memories: bool,
    ) -> TroveResult<Vec<TimelineGroup>> {
        self.blocking(move |inner| {
            inner.project.read(|conn| {
                activity::timeline(
                    conn,
                    hours,
                    grouping,
                    include_activities,
                    include_memories,
                    Utc::now(),
                )
            })
        })
        .await
    }

    // --- sessions ---

    /// Start or resume a session for this project and make it current.
    /// `context_depth` defaults to the configured depth.
    pub async fn start_session(
        &self,
        session_id: Option<String>,
        provide_context: bool,
        context_depth: Option<usize>,
    ) -> TroveResult<SessionStart> {
        let started = self
            .blocking(move |inner| {
                let depth = context_depth.unwrap_or(inner.config.session.context_depth);
                inner.project.write(|tx| {
                    session::start_session(
                        tx,
                        session_id.as_deref(),
                        &inner.project_path,
                        provide_context,
                        depth,
                        Utc::now(),
                    )
                })
            })
            .await?;

        if let Ok(mut current) = self.inner.current_session.lock() {
            *current = Some(started.session.id.clone());
        }
        Ok(started)
    }

    /// Seal a session. Ending an ended session returns it unchanged.
    pub async fn end_session(
        &self,
        session_id: &str,
        summary: Option<String>,
        key_learnings: Option<Vec<String>>,
    ) -> TroveResult<Session> {
        let id = session_id.to_string();
        let ended = self
            .blocking(move |inner| {
                inner.project.write(|tx| {
                    session::end_session(
                        tx,
                        &id,
                        summary.as_deref(),
                        key_learnings.as_deref(),
                        Utc::now(),
                    )
                })
            })
            .await?;

        if let Ok(mut current) = self.inner.current_session.lock() {
            if current.as_deref() == Some(session_id) {
                *current = None;
            }
        }
        Ok(ended)
    }

    /// Continuity text from recently ended sessions. `project_path` defaults
    /// to this project.
    pub async fn session_context(
        &self,
        project_path: Option<String>,
        session_count: usize,
        flags: ContextFlags,
    ) -> TroveResult<String> {
        self.blocking(move |inner| {
            let path = project_path.unwrap_or_else(|| inner.project_path.clone());
            inner
                .project
                .read(|conn| session::context_summary(conn, Some(&path), session_count, flags))
        })
        .await
    }

    pub async fn session_summary(&self, session_id: &str) -> TroveResult<SessionSummary> {
        let id = session_id.to_string();
        self.blocking(move |inner| inner.project.read(|conn| session::session_summary(conn, &id)))
            .await
    }

    pub async fn get_session(&self, session_id: &str) -> TroveResult<Session> {
        let id = session_id.to_string();
        self.blocking(move |inner| inner.project.read(|conn| session::get_session(conn, &id)))
            .await
    }

    // --- review ---

    /// Flag memories idle past the freshness window for review.
    pub async fn mark_stale(&self) -> TroveResult<usize> {
        self.blocking(|inner| {
            let days = inner.config.review.freshness_review_days;
            inner
                .project
                .write(|tx| review::mark_stale_for_review(tx, days, Utc::now()))
        })
        .await
    }

    pub async fn review_candidates(&self, limit: usize) -> TroveResult<Vec<Memory>> {
        self.blocking(move |inner| {
            let days = inner.config.review.freshness_review_days;
            inner
                .project
                .read(|conn| review::review_candidates(conn, days, limit, Utc::now()))
        })
        .await
    }

    /// Apply a review decision and propagate the new status.
    pub async fn review(&self, ids: Vec<String>, action: ReviewAction) -> TroveResult<usize> {
        let targets = ids.clone();
        let changed = self
            .blocking(move |inner| {
                inner
                    .project
                    .write(|tx| review::apply_review(tx, &targets, action, Utc::now()))
            })
            .await?;

        for id in ids {
            if let Ok(memory) = self.get(&id).await {
                self.sync_committed(&memory).await;
            }
        }
        Ok(changed)
    }

    // --- global ---

    fn require_global(inner: &Inner) -> TroveResult<&Arc<Database>> {
        inner
            .global
            .as_ref()
            .ok_or_else(|| TroveError::validation("global store is disabled"))
    }

    /// Search the global store, optionally restricted to projects whose path
    /// contains `project_filter`.
    pub async fn global_search(
        &self,
        mut request: SearchRequest,
        project_filter: Option<String>,
    ) -> TroveResult<SearchResponse> {
        Self::require_global(&self.inner)?;
        if request.limit == 0 {
            request.limit = self.inner.config.search.default_limit;
        }
        if project_filter.is_some() {
            request.filter.project = project_filter;
        }
        let vector = self.query_vector(&request.query, request.mode).await;
        self.blocking(move |inner| {
            Self::require_global(inner)?.read(|conn| {
                search::search(
                    conn,
                    &request,
                    &vector,
                    &inner.config.ranking,
                    &inner.config.search,
                    Utc::now(),
                )
            })
        })
        .await
    }

    pub async fn global_stats(&self) -> TroveResult<GlobalStats> {
        self.blocking(|inner| Self::require_global(inner)?.read(sync::global_stats))
            .await
    }

    /// Sync this project into the global store. `full` examines every memory
    /// and removes orphaned copies; otherwise only recent changes.
    pub async fn sync(&self, full: bool) -> TroveResult<SyncReport> {
        self.blocking(move |inner| {
            let global = Self::require_global(inner)?;
            sync::full_sync(&inner.project, global, &inner.project_path, full, Utc::now())
        })
        .await
    }

    // --- embeddings ---

    /// Queue pending memories for embedding. Returns how many were queued.
    pub async fn backfill_embeddings(&self, limit: usize) -> TroveResult<usize> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || match inner.workers.lock() {
            Ok(workers) => match workers.as_ref() {
                Some(workers) => workers.backfill(limit),
                None => Ok(0),
            },
            Err(_) => Ok(0),
        })
        .await
        .map_err(join_error)?
    }

    /// Wait for queued embedding work to finish. `true` when idle.
    pub async fn wait_for_embeddings(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let in_flight = self
                .inner
                .workers
                .lock()
                .ok()
                .and_then(|w| w.as_ref().map(EmbeddingWorkers::in_flight))
                .unwrap_or(0);
            if in_flight == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop the embedding workers after they drain their queue.
    pub async fn shutdown(&self) {
        let workers = self.inner.workers.lock().ok().and_then(|mut w| w.take());
        if let Some(workers) = workers {
            workers.shutdown().await;
        }
    }

    // --- internals ---

    fn queue_embedding(&self, memory: &Memory) {
        if !memory.embedding_pending {
            return;
        }
        if let Ok(workers) = self.inner.workers.lock() {
            if let Some(workers) = workers.as_ref() {
                workers.enqueue(EmbeddingJob {
                    memory_id: memory.id.clone(),
                    text: embedding_text(&memory.content, memory.context.as_deref()),
                });
            }
        }
    }

    async fn sync_committed(&self, memory: &Memory) {
        if !self.inner.config.sync.global_sync_enabled || self.inner.global.is_none() {
            return;
        }
        let memory = memory.clone();
        let synced = self
            .blocking(move |inner| {
                let global = Self::require_global(inner)?;
                sync::on_memory_committed(
                    &inner.project,
                    global,
                    &inner.project_path,
                    &memory,
                    Utc::now(),
                )
            })
            .await;
        if let Err(e) = synced {
            tracing::warn!(error = %e, "global sync skipped");
        }
    }

    /// Embed the query within the search timeout. Keyword mode never embeds.
    async fn query_vector(&self, query: &str, mode: SearchMode) -> QueryVector {
        if mode == SearchMode::Keyword {
            return QueryVector::Unavailable("keyword mode".into());
        }
        let Some(provider) = self.inner.provider.clone() else {
            return QueryVector::Unavailable("no embedding provider configured".into());
        };
        let text = query.to_string();
        let timeout = self.inner.config.search_timeout();
        let task = tokio::task::spawn_blocking(move || provider.embed(&text));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(vector))) => QueryVector::Ready(vector),
            Ok(Ok(Err(e))) => QueryVector::Unavailable(e.to_string()),
            Ok(Err(e)) => QueryVector::Unavailable(e.to_string()),
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "query embedding timed out");
                QueryVector::Unavailable("query embedding timed out".into())
            }
        }
    }
}

/// Record the provider's model in a fresh store; warn when it differs.
fn check_embedding_model(db: &Database, provider: &dyn EmbeddingProvider) -> TroveResult<()> {
    let model = provider.model_name().to_string();
    if provider.dimensions() != db.embedding_dim() {
        return Err(TroveError::validation(format!(
            "provider produces {} dimensions, store expects {}",
            provider.dimensions(),
            db.embedding_dim()
        )));
    }
    let stored = db.read(|conn| Ok(get_embedding_model(conn)?))?;
    match stored {
        None => db.write(|tx| Ok(set_embedding_model(tx, &model)?)),
        Some(stored) if stored != model => {
            tracing::warn!(
                stored = %stored,
                configured = %model,
                "embedding model changed, existing vectors are not comparable"
            );
            Ok(())
        }
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::HistogramProvider;

    const DIM: usize = 8;

    fn options() -> StoreOptions {
        StoreOptions {
            embedding_dim: DIM,
            ..Default::default()
        }
    }

    fn trove(provider: Option<Arc<dyn EmbeddingProvider>>) -> Trove {
        let mut config = TroveConfig::default();
        config.embedding.dimensions = DIM;
        Trove::with_stores(
            config,
            "/work/app",
            Database::open_in_memory(options()).unwrap(),
            Some(Database::open_in_memory(options()).unwrap()),
            provider,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn forget_requires_confirmation() {
        let trove = trove(None);
        let memory = trove.remember(NewMemory::new("keep me")).await.unwrap();
        assert!(matches!(
            trove.forget(&memory.id, false).await,
            Err(TroveError::Validation(_))
        ));
        trove.forget(&memory.id, true).await.unwrap();
        assert!(matches!(
            trove.get(&memory.id).await,
            Err(TroveError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn remember_syncs_to_global() {
        let trove = trove(None);
        trove.remember(NewMemory::new("shared knowledge")).await.unwrap();
        let stats = trove.global_stats().await.unwrap();
        assert_eq!(stats.by_project["/work/app"], 1);
    }

    #[tokio::test]
    async fn forget_removes_global_copy() {
        let trove = trove(None);
        let memory = trove.remember(NewMemory::new("short lived")).await.unwrap();
        trove.forget(&memory.id, true).await.unwrap();
        assert_eq!(trove.global_stats().await.unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn search_records_access() {
        let trove = trove(None);
        let memory = trove
            .remember(NewMemory::new("Use exponential backoff for retries"))
            .await
            .unwrap();
        let response = trove
            .search(SearchRequest::new("backoff", SearchMode::Keyword))
            .await
            .unwrap();
        assert_eq!(response.hit_ids(), vec![memory.id.clone()]);
        assert_eq!(trove.get(&memory.id).await.unwrap().access_count, 1);
    }

    #[tokio::test]
    async fn semantic_without_provider_is_unavailable() {
        let trove = trove(None);
        trove.remember(NewMemory::new("anything")).await.unwrap();
        assert!(matches!(
            trove.search(SearchRequest::new("anything", SearchMode::Semantic)).await,
            Err(TroveError::EmbeddingUnavailable(_))
        ));
        let hybrid = trove
            .search(SearchRequest::new("anything", SearchMode::Hybrid))
            .await
            .unwrap();
        assert!(hybrid.degraded);
    }

    #[tokio::test]
    async fn current_session_attributes_records() {
        let trove = trove(None);
        let started = trove.start_session(None, false, None).await.unwrap();
        let memory = trove.remember(NewMemory::new("during session")).await.unwrap();
        let logged = trove
            .log_activity(NewActivity::new(crate::activity::EventType::Observation))
            .await
            .unwrap();
        assert_eq!(memory.source_session_id.as_deref(), Some(started.session.id.as_str()));
        assert_eq!(logged.session_id.as_deref(), Some(started.session.id.as_str()));

        trove.end_session(&started.session.id, None, None).await.unwrap();
        assert!(trove.current_session().is_none());
    }

    #[tokio::test]
    async fn provider_width_must_match_store() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HistogramProvider::new(DIM + 1));
        let result = Trove::with_stores(
            TroveConfig::default(),
            "/p",
            Database::open_in_memory(options()).unwrap(),
            None,
            Some(provider),
        );
        assert!(matches!(result, Err(TroveError::Validation(_))));
    }

    #[tokio::test]
    async fn embeddings_fill_in_and_enable_semantic_search() {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(HistogramProvider::new(DIM));
        let trove = trove(Some(provider));
        let memory = trove.remember(NewMemory::new("abc abc abc")).await.unwrap();
        assert!(memory.embedding_pending);
        assert!(trove.wait_for_embeddings(Duration::from_secs(5)).await);
        assert!(!trove.get(&memory.id).await.unwrap().embedding_pending);

        let response = trove
            .search(SearchRequest::new("abc", SearchMode::Semantic))
            .await
            .unwrap();
        assert_eq!(response.hit_ids(), vec![memory.id]);
        trove.shutdown().await;
    }
}
