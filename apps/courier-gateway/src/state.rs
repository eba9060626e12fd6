use std::sync::Arc;

use courier_remote::{BufferedUpload, HttpDocumentService};
use courier_transfer::{
    DocumentService, IndexLinker, MemoryDocumentService, RunCoordinator, ServiceUpload,
    UploadGateway, UploadStrategy,
};

use crate::config::GatewayConfig;

/// Shared handles for request handlers. Everything behind it is read-only after startup.
#[derive(Clone)]
pub struct AppState {
    config: Arc<GatewayConfig>,
    service: Arc<dyn DocumentService>,
    uploads: Arc<UploadGateway>,
    linker: Arc<IndexLinker>,
    runs: Arc<RunCoordinator>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        service: Arc<dyn DocumentService>,
        strategies: Vec<Arc<dyn UploadStrategy>>,
    ) -> Self {
        let uploads = UploadGateway::new(config.upload, strategies);
        let linker = IndexLinker::new(service.clone(), config.link);
        let runs = RunCoordinator::new(service.clone(), config.runs);
        Self {
            config: Arc::new(config),
            service,
            uploads: Arc::new(uploads),
            linker: Arc::new(linker),
            runs: Arc::new(runs),
        }
    }

    /// Streamed uploads first, then the buffered transport.
    pub fn with_remote(config: GatewayConfig, remote: HttpDocumentService) -> Self {
        let remote = Arc::new(remote);
        let strategies: Vec<Arc<dyn UploadStrategy>> = vec![
            Arc::new(ServiceUpload::new(remote.clone())),
            Arc::new(BufferedUpload::new(remote.clone())),
        ];
        Self::new(config, remote, strategies)
    }

    pub fn in_memory(config: GatewayConfig, service: Arc<MemoryDocumentService>) -> Self {
        let strategies: Vec<Arc<dyn UploadStrategy>> =
            vec![Arc::new(ServiceUpload::new(service.clone()))];
        Self::new(config, service, strategies)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<dyn DocumentService> {
        &self.service
    }

    pub fn uploads(&self) -> &UploadGateway {
        &self.uploads
    }

    pub fn linker(&self) -> &IndexLinker {
        &self.linker
    }

    pub fn runs(&self) -> &RunCoordinator {
        &self.runs
    }
}
