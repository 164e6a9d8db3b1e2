//! Root wiring of the analysis service.
//!
//! [`AnalysisContext`] owns every component and is the plain-function
//! surface the REST adapter binds; [`Controller`] adds the process
//! lifecycle around it (web server task, graceful shutdown).

use std::sync::Arc;

use log::{error, info};

use crate::capture::LiveCaptureManager;
use crate::configuration::Configuration;
use crate::connections::controller::ConnectionsController;
use crate::connections::streams::StreamsController;
use crate::error_handling::types::{ControllerError, SessionError};
use crate::flow::stream_assembler::AssemblerConfig;
use crate::importer::PcapImporter;
use crate::notifications::NotificationBus;
use crate::pipeline::Dispatcher;
use crate::rules::RulesManager;
use crate::search::SearchController;
use crate::services::ServicesController;
use crate::statistics::StatisticsController;
use crate::storage::{DatabaseStorage, DocumentStore};

/// Every component of the core, fully wired. The REST layer and the tests
/// call operations directly on the fields.
pub struct AnalysisContext {
    pub config: Configuration,
    pub store: Arc<dyn DocumentStore>,
    pub notifications: NotificationBus,
    pub rules: Arc<RulesManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub importer: Arc<PcapImporter>,
    pub capture: Arc<LiveCaptureManager>,
    pub connections: Arc<ConnectionsController>,
    pub streams: Arc<StreamsController>,
    pub services: Arc<ServicesController>,
    pub statistics: Arc<StatisticsController>,
    pub search: Arc<SearchController>,
}

impl AnalysisContext {
    /// Wire all components onto `store`. Reserved directories are created
    /// here; failures at this stage are fatal by design.
    pub fn new(
        config: Configuration,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Arc<Self>, ControllerError> {
        std::fs::create_dir_all(config.processing_dir())?;
        std::fs::create_dir_all(config.connections_dir())?;

        let notifications = NotificationBus::new();
        let statistics = Arc::new(StatisticsController::new(store.clone()));
        let rules = Arc::new(RulesManager::new(store.clone(), notifications.clone())?);

        let assembler_config = AssemblerConfig {
            max_gap_bytes: config.max_gap_bytes,
            max_flow_bytes: config.max_flow_bytes,
            max_flows: config.max_flows,
            idle_timeout: config.idle_timeout(),
        };
        let dispatcher = Arc::new(Dispatcher::start(
            config.workers,
            config.channel_capacity,
            assembler_config,
            store.clone(),
            rules.index_handle(),
            notifications.clone(),
            statistics.clone(),
        ));

        let importer = Arc::new(PcapImporter::new(
            dispatcher.clone(),
            store.clone(),
            notifications.clone(),
            config.pcaps_dir(),
            config.processing_dir(),
        )?);
        let capture = Arc::new(LiveCaptureManager::new(
            importer.clone(),
            notifications.clone(),
            config.rotation_interval(),
        ));

        let connections = Arc::new(ConnectionsController::new(
            store.clone(),
            notifications.clone(),
        ));
        let streams = Arc::new(StreamsController::new(store.clone()));
        let services = Arc::new(ServicesController::new(
            store.clone(),
            notifications.clone(),
        ));
        let search = Arc::new(SearchController::new(store.clone()));

        Ok(Arc::new(Self {
            config,
            store,
            notifications,
            rules,
            dispatcher,
            importer,
            capture,
            connections,
            streams,
            services,
            statistics,
            search,
        }))
    }
}

pub struct Controller {
    context: Arc<AnalysisContext>,
}

impl Controller {
    /// Initialize against the on-disk SQLite store. Inability to open the
    /// store aborts startup; this is the only fatal failure path.
    pub fn new(config: Configuration) -> Result<Self, ControllerError> {
        let store: Arc<dyn DocumentStore> =
            Arc::new(DatabaseStorage::new_file(config.database_path())?);
        let context = AnalysisContext::new(config, store)?;
        Ok(Self { context })
    }

    pub fn context(&self) -> Arc<AnalysisContext> {
        self.context.clone()
    }

    /// Serve until the shutdown signal fires, then drain everything.
    pub async fn run(
        &self,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), ControllerError> {
        let web_handle = if self.context.config.web_disabled {
            None
        } else {
            let context = self.context.clone();
            let bind = (
                self.context
                    .config
                    .bind_address
                    .parse::<std::net::IpAddr>()
                    .map_err(|err| {
                        ControllerError::Io(std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            err,
                        ))
                    })?,
                self.context.config.web_port,
            );
            Some(tokio::spawn(async move {
                crate::web_interface::WebServer::new(context).serve(bind).await;
            }))
        };

        info!("analysis service operational");
        if shutdown_rx.recv().await.is_err() {
            error!("shutdown channel closed unexpectedly");
        }

        info!("controller initiating graceful shutdown");
        if let Some(handle) = web_handle {
            handle.abort();
            let _ = handle.await;
        }
        self.shutdown();
        Ok(())
    }

    /// Stop capture, cancel running imports, flush and join the pipeline.
    pub fn shutdown(&self) {
        match self.context.capture.stop_capture() {
            Ok(()) => {}
            Err(SessionError::NoCaptureRunning) => {}
            Err(err) => error!("capture shutdown failed: {}", err),
        }
        self.context.importer.cancel_all();
        self.context.importer.flush_pipeline();
        self.context.dispatcher.shutdown();
        info!("controller shutdown completed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use tempfile::TempDir;

    pub(crate) fn test_context() -> (Arc<AnalysisContext>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Configuration {
            data_dir: dir.path().to_path_buf(),
            workers: 2,
            web_disabled: true,
            ..Default::default()
        };
        let context = AnalysisContext::new(config, Arc::new(MemoryStorage::new())).unwrap();
        (context, dir)
    }

    #[test]
    fn test_context_wires_and_creates_reserved_dirs() {
        let (context, dir) = test_context();
        assert!(dir.path().join("pcaps").join("processing").is_dir());
        assert!(dir.path().join("connections").is_dir());
        assert_eq!(context.rules.get_rules().len(), 0);
        assert!(context.importer.get_sessions().is_empty());
        assert!(!context.capture.is_running());
        context.dispatcher.shutdown();
    }
}
