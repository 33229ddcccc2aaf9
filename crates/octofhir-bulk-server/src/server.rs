use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use octofhir_bulk::{
    BulkExportService, CodeSetResolver, ExportStatusStore, ExportWorker, FilterCompiler,
    InMemoryJobQueue, InMemoryStatusStore, JobQueue, MembershipResolver, ResourceMaterializer,
    ServiceSettings, WorkerPool,
};
use octofhir_db_memory::create_fhir_storage;
use octofhir_search::SearchParameterRegistry;
use octofhir_storage::FhirStorage;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{config::AppConfig, handlers};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn FhirStorage>,
    pub exports: BulkExportService,
}

/// The router plus the export workers serving it.
pub struct BulkExportApp {
    pub router: Router,
    pub state: AppState,
    queue: Arc<dyn JobQueue>,
    workers: WorkerPool,
}

impl BulkExportApp {
    /// Stops accepting jobs and waits for the workers to drain the queue.
    pub async fn shutdown(self) {
        self.queue.close().await;
        self.workers.join().await;
        tracing::info!("export workers stopped");
    }
}

/// Wires storage, the export engine and its worker pool behind the router.
pub async fn build_app(cfg: &AppConfig) -> anyhow::Result<BulkExportApp> {
    build_app_with_storage(cfg, create_fhir_storage()).await
}

pub async fn build_app_with_storage(
    cfg: &AppConfig,
    storage: Arc<dyn FhirStorage>,
) -> anyhow::Result<BulkExportApp> {
    let bulk = &cfg.bulk_export;
    tokio::fs::create_dir_all(&bulk.export_path).await?;

    let compiler = FilterCompiler::new(Arc::new(SearchParameterRegistry::with_defaults()));
    let code_sets = CodeSetResolver::new(storage.clone());
    let membership = MembershipResolver::new(
        storage.clone(),
        compiler.clone(),
        code_sets.clone(),
        bulk.batch_size,
    );
    let materializer = Arc::new(ResourceMaterializer::new(
        storage.clone(),
        code_sets,
        bulk.export_path.clone(),
        bulk.batch_size,
        bulk.failure_policy,
    ));
    let store: Arc<dyn ExportStatusStore> = Arc::new(InMemoryStatusStore::new());
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());

    let worker = ExportWorker::new(store.clone(), compiler.clone(), membership.clone(), materializer)
        .with_job_timeout(bulk.job_timeout());
    let workers = WorkerPool::spawn(worker, queue.clone(), bulk.workers);
    tracing::info!(
        workers = workers.size(),
        storage = storage.backend_name(),
        export_path = %bulk.export_path.display(),
        failure_policy = ?bulk.failure_policy,
        "Bulk export workers started"
    );

    let exports = BulkExportService::new(
        store,
        queue.clone(),
        compiler,
        membership,
        ServiceSettings {
            base_url: cfg.base_url(),
            export_path: bulk.export_path.clone(),
            requires_access_token: bulk.requires_access_token,
            limiter: bulk.limiter(),
        },
    );
    let state = AppState { storage, exports };

    Ok(BulkExportApp {
        router: router(state.clone(), cfg.server.body_limit_bytes),
        state,
        queue,
        workers,
    })
}

pub fn router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        // Bulk data kickoff, status and output files
        .route(
            "/$export",
            get(handlers::system_export).post(handlers::system_export),
        )
        .route(
            "/Patient/$export",
            get(handlers::patient_export).post(handlers::patient_export),
        )
        .route(
            "/Group/{id}/$export",
            get(handlers::group_export).post(handlers::group_export),
        )
        .route("/bulkstatus/{job_id}", get(handlers::export_status))
        .route("/bulkfiles/{job_id}/{file_name}", get(handlers::export_file))
        // Resource endpoints
        .route("/{resource_type}", post(handlers::create_resource))
        .route(
            "/{resource_type}/{id}",
            get(handlers::read_resource).put(handlers::update_resource),
        )
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http().make_span_with(
                        |req: &axum::http::Request<_>| {
                            tracing::info_span!(
                                "http.request",
                                http.method = %req.method(),
                                http.target = %req.uri(),
                            )
                        },
                    ),
                )
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

pub struct BulkExportServer {
    addr: SocketAddr,
    app: BulkExportApp,
}

pub struct ServerBuilder {
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    pub async fn build(self) -> anyhow::Result<BulkExportServer> {
        let app = build_app(&self.config).await?;
        Ok(BulkExportServer {
            addr: self.config.addr(),
            app,
        })
    }
}

impl BulkExportServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app.router.clone())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        self.app.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
