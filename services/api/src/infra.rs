use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tenant_repairs::config::RepairConfig;
use tenant_repairs::workflows::repairs::{
    Collaborators, Delivery, DeliveryReceipt, InMemoryDirectory, InMemoryRepairStore, Locale,
    NotificationTransport, RepairService, TransportError, UnitResponsibles, UserId,
};
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
    pub(crate) catalog_size: usize,
}

pub(crate) const DEMO_UNIT: &str = "zh-langstrasse-12-3og";
pub(crate) const DEMO_COMPANY: &str = "sanitaer-brunner";

/// Keeps every delivery so the demo can print what went out.
#[derive(Default, Clone)]
pub(crate) struct TranscriptTransport {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
}

#[async_trait]
impl NotificationTransport for TranscriptTransport {
    async fn send(&self, delivery: Delivery) -> Result<DeliveryReceipt, TransportError> {
        info!(
            notification = %delivery.notification,
            recipient = %delivery.recipient,
            template = delivery.template,
            "notification queued for delivery"
        );
        let mut guard = self
            .deliveries
            .lock()
            .map_err(|_| TransportError::Unavailable("transcript mutex poisoned".to_string()))?;
        guard.push(delivery);
        Ok(DeliveryReceipt {
            accepted_at: Utc::now(),
        })
    }
}

impl TranscriptTransport {
    pub(crate) fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

/// One property with its responsibles, a registered plumbing company and a reporter.
pub(crate) fn demo_directory() -> InMemoryDirectory {
    InMemoryDirectory::new()
        .with_unit(
            DEMO_UNIT,
            UnitResponsibles {
                owners: vec![UserId("vera.huber".to_string())],
                administrators: vec![UserId("thomas.frei".to_string())],
                janitors: vec![UserId("nico.meier".to_string())],
            },
        )
        .with_company(
            DEMO_COMPANY,
            Some("auftrag@sanitaer-brunner.ch"),
            &["luca.brunner"],
        )
        .with_company("elektro-zueri", Some("info@elektro-zueri.ch"), &[])
        .with_reporter("mara.keller")
        .with_locale("vera.huber", Locale::En)
}

pub(crate) struct DemoWorld {
    pub(crate) service: RepairService<InMemoryRepairStore>,
    pub(crate) store: Arc<InMemoryRepairStore>,
    pub(crate) transport: TranscriptTransport,
}

pub(crate) fn demo_world(config: RepairConfig) -> DemoWorld {
    let store = Arc::new(InMemoryRepairStore::new());
    let transport = TranscriptTransport::default();
    let collaborators =
        Collaborators::from_directory(Arc::new(demo_directory()), Arc::new(transport.clone()));
    DemoWorld {
        service: RepairService::new(store.clone(), collaborators, config),
        store,
        transport,
    }
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}
