// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod config;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

pub use config::{
    AppConfig, CheckpointConfig, ConfigError, ContinuationConfig, DestinationConfig, NotifyConfig,
    ReaperConfig,
};
use relay::{
    CheckpointStore, ContinuationDispatcher, FileCheckpointStore, HttpBigObjectClient,
    HttpContinuationDispatcher, LogNotifier, MemoryCheckpointStore, Notifier, QueueDispatcher,
    QueueWorker, Reaper, SessionRunner, TaskQueue, WebhookNotifier,
};
use relayer_server::{
    ServiceHandler,
    http::{RouteHandler, health_routes, start_rest_server},
    invocation::{RelayState, route_handler},
};
use smart_default::SmartDefault;
use snafu::{ResultExt, Whatever};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Represents the main application with lifecycle management
#[derive(SmartDefault)]
pub struct App {
    /// Application configuration
    pub config:             AppConfig,
    /// Controls if the application should continue running
    #[default(_code = "Arc::new(AtomicBool::new(false))")]
    pub running:            Arc<AtomicBool>,
    /// Cancellation token for graceful shutdown
    #[default(_code = "CancellationToken::new()")]
    pub cancellation_token: CancellationToken,
}

impl AppConfig {
    #[must_use]
    pub fn open(self) -> App {
        App {
            config: self,
            ..Default::default()
        }
    }
}

/// Handle for controlling a running application
pub struct AppHandle {
    /// Sender for triggering shutdown
    shutdown_tx:        Option<oneshot::Sender<()>>,
    /// Application running flag
    running:            Arc<AtomicBool>,
    /// Cancellation token
    cancellation_token: CancellationToken,
    /// Address the REST server is bound to
    local_addr:         std::net::SocketAddr,
    /// Completes once every background task has stopped
    stopped:            JoinHandle<()>,
}

impl AppHandle {
    /// Gracefully shutdown the application
    pub fn shutdown(&mut self) {
        info!("Initiating graceful shutdown");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Check if the application is still running
    #[must_use]
    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }

    #[must_use]
    pub const fn local_addr(&self) -> std::net::SocketAddr { self.local_addr }

    /// Wait for the shutdown signal, then for every task to stop.
    pub async fn wait_for_shutdown(self) {
        self.cancellation_token.cancelled().await;
        if let Err(err) = self.stopped.await {
            warn!(error = %err, "shutdown task failed");
        }
    }
}

/// Engine components shared by the worker, the reaper and the routes.
struct Components {
    store:      Arc<dyn CheckpointStore>,
    notifier:   Arc<dyn Notifier>,
    dispatcher: Arc<dyn ContinuationDispatcher>,
    runner:     Arc<SessionRunner>,
}

impl App {
    fn components(&self, queue: &TaskQueue) -> Result<Components, Whatever> {
        let config = &self.config;
        let client = config
            .relay
            .http_client()
            .whatever_context("Failed to build HTTP client")?;

        let store: Arc<dyn CheckpointStore> = match &config.checkpoint.dir {
            Some(dir) => {
                info!(dir = %dir.display(), "Using file checkpoint store");
                Arc::new(FileCheckpointStore::new(dir.clone()))
            }
            None => {
                warn!("No checkpoint dir configured, checkpoints are kept in memory");
                Arc::new(MemoryCheckpointStore::new())
            }
        };

        let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
            Some(url) => Arc::new(
                WebhookNotifier::new(client.clone(), url.clone())
                    .whatever_context("Invalid notify webhook")?,
            ),
            None => Arc::new(LogNotifier),
        };

        let dispatcher: Arc<dyn ContinuationDispatcher> = match &config.continuation.endpoint {
            Some(endpoint) => {
                let mut dispatcher = HttpContinuationDispatcher::new(client.clone(), endpoint.clone())
                    .whatever_context("Invalid continuation endpoint")?;
                if let Some(token) = &config.continuation.token {
                    dispatcher = dispatcher.with_token(token.clone());
                }
                Arc::new(dispatcher)
            }
            None => Arc::new(QueueDispatcher::new(queue.clone())),
        };

        let destination = HttpBigObjectClient::new(
            client.clone(),
            config.destination.base_url.clone(),
            config.destination.token.clone(),
        )
        .whatever_context("Invalid destination configuration")?;

        let runner = SessionRunner::builder()
            .config(config.relay.clone())
            .store(store.clone())
            .destination(Arc::new(destination))
            .dispatcher(dispatcher.clone())
            .notifier(notifier.clone())
            .client(client)
            .build()
            .whatever_context("Invalid relay configuration")?;

        Ok(Components {
            store,
            notifier,
            dispatcher,
            runner: Arc::new(runner),
        })
    }

    /// Start the application and return a handle for controlling it
    pub async fn start(&self) -> Result<AppHandle, Whatever> {
        info!("Starting relayer");

        let (queue, receiver) = TaskQueue::new();
        let components = self.components(&queue)?;

        let state = RelayState::new(queue, components.store.clone())
            .with_auth_token(self.config.continuation.token.clone());
        let handlers: Vec<RouteHandler> = vec![Box::new(health_routes), route_handler(state)];
        let mut http_handle = start_rest_server(self.config.http.clone(), handlers)
            .await
            .whatever_context("Failed to start REST server")?;
        http_handle
            .wait_for_start()
            .await
            .whatever_context("REST server did not start")?;
        let local_addr = http_handle.local_addr();

        let worker = QueueWorker::new(receiver, components.runner.clone());
        let worker_handle = tokio::spawn(worker.run(self.cancellation_token.clone()));

        let reaper_handle = self.config.reaper.enabled.then(|| {
            let reaper = Reaper::new(
                &self.config.relay,
                self.config.reaper.policy,
                components.store.clone(),
                components.dispatcher.clone(),
                components.notifier.clone(),
            );
            tokio::spawn(reaper.run(self.cancellation_token.clone()))
        });

        self.running.store(true, Ordering::SeqCst);
        info!(%local_addr, "Application started successfully");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let running = Arc::clone(&self.running);
        let cancellation_token = self.cancellation_token.clone();
        let enable_graceful_shutdown = self.config.enable_graceful_shutdown;

        let stopped = tokio::spawn(async move {
            if enable_graceful_shutdown {
                shutdown_signal(shutdown_rx).await;
            } else {
                let _ = shutdown_rx.await;
            }

            running.store(false, Ordering::SeqCst);
            cancellation_token.cancel();
            stop(http_handle, worker_handle, reaper_handle).await;
            info!("Application shutdown complete");
        });

        Ok(AppHandle {
            shutdown_tx: Some(shutdown_tx),
            running: Arc::clone(&self.running),
            cancellation_token: self.cancellation_token.clone(),
            local_addr,
            stopped,
        })
    }

    /// Run the application blocking until it's shut down
    pub async fn run(self) -> Result<(), Whatever> {
        let handle = self.start().await?;
        handle.wait_for_shutdown().await;
        Ok(())
    }
}

async fn stop(
    http_handle: ServiceHandler,
    worker_handle: JoinHandle<()>,
    reaper_handle: Option<JoinHandle<()>>,
) {
    info!("Shutting down servers");
    http_handle.shutdown();
    http_handle.wait_for_stop().await;

    // The worker lets running invocations finish; their checkpoints stay
    // resumable either way.
    if let Err(err) = worker_handle.await {
        warn!(error = %err, "queue worker failed");
    }
    if let Some(reaper_handle) = reaper_handle
        && let Err(err) = reaper_handle.await
    {
        warn!(error = %err, "reaper failed");
    }
}

async fn shutdown_signal(shutdown_rx: oneshot::Receiver<()>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C signal"); },
        () = terminate => { info!("Received terminate signal"); },
        _ = shutdown_rx => { info!("Received shutdown signal"); },
    }
}

#[cfg(test)]
mod tests {
    use relayer_server::http::RestServerConfig;

    use super::*;

    fn test_config(checkpoint_dir: Option<std::path::PathBuf>) -> AppConfig {
        AppConfig::builder()
            .http(
                RestServerConfig::builder()
                    .bind_address("127.0.0.1:0")
                    .build(),
            )
            .destination(DestinationConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                token:    "token".to_string(),
            })
            .checkpoint(CheckpointConfig {
                dir: checkpoint_dir,
            })
            .enable_graceful_shutdown(false)
            .build()
    }

    #[tokio::test]
    async fn test_app_creation() {
        let app = AppConfig::default().open();
        assert!(!app.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_missing_destination_fails_to_start() {
        let app = AppConfig::builder()
            .http(
                RestServerConfig::builder()
                    .bind_address("127.0.0.1:0")
                    .build(),
            )
            .build()
            .open();
        assert!(app.start().await.is_err());
        assert!(!app.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_app_handle_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_config(Some(dir.path().to_path_buf())).open();

        let mut handle = app.start().await.unwrap();
        assert!(handle.is_running());

        let response = reqwest::get(format!("http://{}/health", handle.local_addr()))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        handle.shutdown();
        let running = Arc::clone(&app.running);
        handle.wait_for_shutdown().await;
        assert!(!running.load(Ordering::SeqCst));
    }
}
