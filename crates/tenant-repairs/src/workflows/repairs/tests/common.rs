use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::RepairConfig;
use crate::workflows::repairs::directory::UnitResponsibles;
use crate::workflows::repairs::domain::{
    Actor, AssignmentKind, Bid, CompanyId, DocumentRef, OfferId, OfferTarget, Role, TicketDetails,
    TicketId, UnitId, UserId,
};
use crate::workflows::repairs::memory::{InMemoryDirectory, InMemoryRepairStore};
use crate::workflows::repairs::notifications::{
    Delivery, DeliveryReceipt, NotificationTransport, Recipient, TransportError,
};
use crate::workflows::repairs::service::{Collaborators, RepairService};

pub(super) const UNIT: &str = "unit-3b";
pub(super) const SANITAER: &str = "sanitaer-ag";
pub(super) const ELEKTRO: &str = "elektro-gmbh";

/// Records deliveries; can be told to refuse some users or to stall.
#[derive(Default)]
pub(super) struct RecordingTransport {
    deliveries: Mutex<Vec<Delivery>>,
    refused: Mutex<HashSet<UserId>>,
    stall: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub(super) fn refuse(&self, user: &str) {
        self.refused
            .lock()
            .expect("transport mutex poisoned")
            .insert(UserId(user.to_string()));
    }

    pub(super) fn heal(&self) {
        self.refused.lock().expect("transport mutex poisoned").clear();
        *self.stall.lock().expect("transport mutex poisoned") = None;
    }

    pub(super) fn stall_for(&self, duration: Duration) {
        *self.stall.lock().expect("transport mutex poisoned") = Some(duration);
    }

    pub(super) fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .expect("transport mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn send(&self, delivery: Delivery) -> Result<DeliveryReceipt, TransportError> {
        let stall = *self.stall.lock().expect("transport mutex poisoned");
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }

        let refused = match &delivery.recipient {
            Recipient::User { user, .. } => self
                .refused
                .lock()
                .expect("transport mutex poisoned")
                .contains(user),
            _ => false,
        };
        if refused {
            return Err(TransportError::Unavailable("push gateway down".to_string()));
        }

        self.deliveries
            .lock()
            .expect("transport mutex poisoned")
            .push(delivery);
        Ok(DeliveryReceipt {
            accepted_at: Utc::now(),
        })
    }
}

pub(super) fn directory() -> InMemoryDirectory {
    InMemoryDirectory::new()
        .with_unit(
            UNIT,
            UnitResponsibles {
                owners: vec![UserId("olivia".to_string())],
                administrators: vec![UserId("adam".to_string())],
                janitors: vec![UserId("jana".to_string())],
            },
        )
        .with_company(SANITAER, Some("office@sanitaer.ch"), &["sam"])
        .with_company(ELEKTRO, Some("info@elektro.ch"), &["eli"])
        .with_reporter("rita")
}

pub(super) fn rita() -> Actor {
    Actor::new("rita", Role::Reporter)
}

pub(super) fn adam() -> Actor {
    Actor::new("adam", Role::Administrator)
}

pub(super) fn olivia() -> Actor {
    Actor::new("olivia", Role::Owner)
}

pub(super) fn jana() -> Actor {
    Actor::new("jana", Role::Janitor)
}

pub(super) fn sam() -> Actor {
    Actor::new("sam", Role::Company)
}

pub(super) fn eli() -> Actor {
    Actor::new("eli", Role::Company)
}

pub(super) fn company(id: &str) -> CompanyId {
    CompanyId(id.to_string())
}

pub(super) fn user(id: &str) -> UserId {
    UserId(id.to_string())
}

pub(super) fn details(title: &str) -> TicketDetails {
    TicketDetails {
        unit: UnitId(UNIT.to_string()),
        title: title.to_string(),
        description: "Water dripping below the sink".to_string(),
        location: "2nd floor, kitchen".to_string(),
        device_affected: true,
        signature_required: false,
        documents: vec![DocumentRef("doc-photo-1".to_string())],
    }
}

pub(super) struct Harness {
    pub(super) service: RepairService<InMemoryRepairStore>,
    pub(super) store: Arc<InMemoryRepairStore>,
    pub(super) directory: Arc<InMemoryDirectory>,
    pub(super) transport: Arc<RecordingTransport>,
}

pub(super) fn harness() -> Harness {
    harness_with(RepairConfig::default())
}

pub(super) fn harness_with(config: RepairConfig) -> Harness {
    let store = Arc::new(InMemoryRepairStore::new());
    let directory = Arc::new(directory());
    let transport = Arc::new(RecordingTransport::default());
    let collaborators = Collaborators::from_directory(directory.clone(), transport.clone());
    let service = RepairService::new(store.clone(), collaborators, config);
    Harness {
        service,
        store,
        directory,
        transport,
    }
}

impl Harness {
    pub(super) async fn open_ticket(&self, title: &str) -> TicketId {
        self.service
            .create(&rita(), details(title))
            .await
            .expect("ticket created")
            .ticket
            .id
    }

    /// Assign the sanitary company and ask it for an offer.
    pub(super) async fn solicit(&self, ticket: &TicketId) {
        self.service
            .assign_company(&adam(), ticket, &company(SANITAER), AssignmentKind::Assigned)
            .await
            .expect("company assigned");
        self.service
            .request_offer(
                &adam(),
                ticket,
                OfferTarget::Registered(company(SANITAER)),
                None,
            )
            .await
            .expect("offer requested");
    }

    pub(super) async fn solicited_ticket(&self) -> TicketId {
        let ticket = self.open_ticket("Leaking sink").await;
        self.solicit(&ticket).await;
        ticket
    }

    pub(super) async fn submit(&self, ticket: &TicketId, actor: &Actor, total: u64) -> OfferId {
        self.service
            .submit_offer(actor, ticket, Bid::new("Replace siphon and seal", total))
            .await
            .expect("offer submitted")
            .offer
            .expect("offer returned")
            .id
    }

    /// Solicit, bid 500 and accept on an existing ticket.
    pub(super) async fn accept_on(&self, ticket: &TicketId) -> OfferId {
        self.solicit(ticket).await;
        let offer = self.submit(ticket, &sam(), 500).await;
        self.service
            .accept_offer(&olivia(), ticket, &offer)
            .await
            .expect("offer accepted");
        offer
    }

    pub(super) async fn accepted_ticket(&self) -> (TicketId, OfferId) {
        let ticket = self.open_ticket("Leaking sink").await;
        let offer = self.accept_on(&ticket).await;
        (ticket, offer)
    }

    pub(super) async fn closed_ticket(&self) -> TicketId {
        let (ticket, _) = self.accepted_ticket().await;
        self.service
            .mark_repaired(&sam(), &ticket, None, Some("Siphon replaced".to_string()))
            .await
            .expect("repair confirmed");
        self.service
            .close(&adam(), &ticket, None)
            .await
            .expect("ticket closed");
        ticket
    }
}
