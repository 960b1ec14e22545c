use std::sync::Arc;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::consent::ConsentGate;
use crate::directory::PortalDirectory;
use crate::dispatcher::Dispatcher;
use crate::error::NotificationError;
use crate::gateway::SmsGateway;
use crate::orchestrator::AutomationOrchestrator;
use crate::processor::NotificationProcessor;
use crate::retry::RetryEngine;
use crate::service::NotificationEngine;
use crate::store::{ConsentStore, DeliveryLog, NotificationStore};
use crate::templates::TemplateRenderer;
use crate::tracker::DeliveryTracker;

/// Storage backends and collaborators the engine is built from
pub struct Backends {
    pub notifications: Arc<dyn NotificationStore>,
    pub consent: Arc<dyn ConsentStore>,
    pub log: Arc<dyn DeliveryLog>,
    pub directory: Arc<dyn PortalDirectory>,
    pub gateway: Arc<dyn SmsGateway>,
    pub clock: Arc<dyn Clock>,
}

/// Every component wired once at process start and shared by reference
#[derive(Clone)]
pub struct NotificationSystem {
    pub engine: Arc<NotificationEngine>,
    pub consent: Arc<ConsentGate>,
    pub tracker: Arc<DeliveryTracker>,
    pub retry: Arc<RetryEngine>,
    pub orchestrator: Arc<AutomationOrchestrator>,
    config: EngineConfig,
}

impl NotificationSystem {
    pub fn build(backends: Backends, config: EngineConfig) -> Result<Self, NotificationError> {
        config.validate().map_err(NotificationError::InvalidConfig)?;

        let templates = Arc::new(TemplateRenderer::with_defaults());
        let consent = Arc::new(ConsentGate::new(
            backends.consent,
            backends.directory.clone(),
            templates.clone(),
            backends.clock.clone(),
            &config,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            backends.notifications.clone(),
            backends.log.clone(),
            backends.gateway,
            templates.clone(),
            backends.clock.clone(),
            config.gateway.clone(),
        ));
        let engine = Arc::new(NotificationEngine::new(
            backends.notifications.clone(),
            backends.log.clone(),
            consent.clone(),
            dispatcher,
            templates,
            backends.clock.clone(),
            &config,
        )?);
        let tracker = Arc::new(DeliveryTracker::new(
            backends.notifications,
            backends.log.clone(),
            backends.clock.clone(),
        ));
        let retry = Arc::new(RetryEngine::new(
            engine.clone(),
            backends.log,
            config.retry.clone(),
        ));
        let orchestrator = Arc::new(AutomationOrchestrator::new(
            engine.clone(),
            backends.directory,
            backends.clock,
            &config,
        )?);

        Ok(Self {
            engine,
            consent,
            tracker,
            retry,
            orchestrator,
            config,
        })
    }

    pub fn processor(&self) -> NotificationProcessor {
        NotificationProcessor::new(
            self.engine.clone(),
            self.retry.clone(),
            self.consent.clone(),
            &self.config,
        )
    }
}
