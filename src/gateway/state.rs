use std::sync::Arc;

use crate::compensation::CompensationAuditStore;
use crate::metrics::SagaMetrics;
use crate::transfer::TransferOrchestrator;

/// Gateway shared state
#[derive(Clone)]
pub struct AppState {
    /// Client-facing transfer service
    pub orchestrator: Arc<TransferOrchestrator>,
    pub metrics: Arc<SagaMetrics>,
    /// Operator views read the audit store directly
    pub audits: Arc<dyn CompensationAuditStore>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<TransferOrchestrator>,
        metrics: Arc<SagaMetrics>,
        audits: Arc<dyn CompensationAuditStore>,
    ) -> Self {
        Self {
            orchestrator,
            metrics,
            audits,
        }
    }
}
