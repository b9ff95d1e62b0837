//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::BackendError;
use crate::server::serve::serve;
use crate::tooling::runner::{CommandRunner, SystemRunner};
use crate::workers::cleanup;

/// Run the deployment backend until the shutdown signal fires
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BackendError> {
    run_with_runner(options, Arc::new(SystemRunner::new()), shutdown_signal).await
}

/// Same as [`run`] with an explicit command runner
pub async fn run_with_runner(
    options: AppOptions,
    runner: Arc<dyn CommandRunner>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BackendError> {
    info!("Initializing Strands deployment backend...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, runner, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start backend: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    runner: Arc<dyn CommandRunner>,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), BackendError> {
    let app_state = Arc::new(AppState::init(options, runner).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    init_cleanup_worker(
        options.cleanup_worker.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_http_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await
}

fn init_cleanup_worker(
    options: cleanup::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), BackendError> {
    info!("Initializing status cleanup worker...");

    let statuses = app_state.statuses.clone();
    let build_logs = app_state.builder.logs();
    let handle = tokio::spawn(async move {
        cleanup::run(
            &options,
            statuses,
            build_logs,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_cleanup_worker_handle(handle)
}

async fn init_http_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), BackendError> {
    info!("Initializing HTTP server...");

    let server_state = Arc::new(app_state.server_state(options));
    let handle = serve(&options.server, server_state, async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), BackendError>>>,
    cleanup_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            cleanup_worker_handle: None,
        }
    }

    fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), BackendError> {
        if self.app_state.is_some() {
            return Err(BackendError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    fn with_cleanup_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), BackendError> {
        if self.cleanup_worker_handle.is_some() {
            return Err(BackendError::ShutdownError(
                "cleanup_worker_handle already set".to_string(),
            ));
        }
        self.cleanup_worker_handle = Some(handle);
        Ok(())
    }

    fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), BackendError>>,
    ) -> Result<(), BackendError> {
        if self.server_handle.is_some() {
            return Err(BackendError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), BackendError> {
        let _ = self.shutdown_tx.send(());

        let max_delay = self.lifecycle_options.max_shutdown_delay;
        match tokio::time::timeout(max_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!("Shutdown timed out after {:?}, forcing shutdown...", max_delay);
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), BackendError> {
        info!("Shutting down Strands deployment backend...");

        // 1. Stop accepting requests
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| BackendError::ShutdownError(e.to_string()))??;
        }

        // 2. Cleanup worker
        if let Some(handle) = self.cleanup_worker_handle.take() {
            handle
                .await
                .map_err(|e| BackendError::ShutdownError(e.to_string()))?;
        }

        // 3. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
