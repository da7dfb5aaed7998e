//! Append-only history of everything that happened to a ticket.
//!
//! Entries are the replay source for ticket status: sorting a ticket's entries by
//! `(recorded_at, sequence)` and taking the last status reproduces the stored status.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Actor, AuditEntryId, CompanyKey, DocumentRef, LocalizedText, OfferId, OfferRequestId, Role,
    TicketId, UserId,
};
use super::repository::{AuditTrail, RepositoryError};
use super::status::{Operation, TicketStatus};

/// Kind of lifecycle event; also the template key for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Assigned,
    OfferRequested,
    OfferRequestDeclined,
    OfferSubmitted,
    OfferAccepted,
    RepairScheduled,
    Repaired,
    SignatureConfirmed,
    Closed,
    Rejected,
    Cancelled,
    Split,
    SplitFrom,
    Commented,
    Deleted,
}

impl EventKind {
    pub const fn key(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Assigned => "assigned",
            Self::OfferRequested => "offer_requested",
            Self::OfferRequestDeclined => "offer_request_declined",
            Self::OfferSubmitted => "offer_submitted",
            Self::OfferAccepted => "offer_accepted",
            Self::RepairScheduled => "repair_scheduled",
            Self::Repaired => "repaired",
            Self::SignatureConfirmed => "signature_confirmed",
            Self::Closed => "closed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Split => "split",
            Self::SplitFrom => "split_from",
            Self::Commented => "commented",
            Self::Deleted => "deleted",
        }
    }

    /// Lifecycle operation that records this kind of event.
    pub const fn operation(self) -> Operation {
        match self {
            Self::Created => Operation::Create,
            Self::Assigned => Operation::AssignCompany,
            Self::OfferRequested => Operation::RequestOffer,
            Self::OfferRequestDeclined => Operation::DeclineRequest,
            Self::OfferSubmitted => Operation::SubmitOffer,
            Self::OfferAccepted => Operation::AcceptOffer,
            Self::RepairScheduled => Operation::ScheduleRepair,
            Self::Repaired => Operation::MarkRepaired,
            Self::SignatureConfirmed => Operation::ConfirmSignature,
            Self::Closed => Operation::Close,
            Self::Rejected => Operation::Reject,
            Self::Cancelled => Operation::Cancel,
            Self::Split | Self::SplitFrom => Operation::Split,
            Self::Commented => Operation::Comment,
            Self::Deleted => Operation::Delete,
        }
    }
}

/// Structured context attached to an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub responsible_users: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<LocalizedText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<OfferId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<OfferRequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<CompanyKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_tickets: Vec<TicketId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<DocumentRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl AuditPayload {
    pub fn with_offer(mut self, offer: OfferId) -> Self {
        self.offer = Some(offer);
        self
    }

    pub fn with_request(mut self, request: OfferRequestId) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_company(mut self, company: CompanyKey) -> Self {
        self.company = Some(company);
        self
    }

    pub fn with_related(mut self, tickets: Vec<TicketId>) -> Self {
        self.related_tickets = tickets;
        self
    }

    pub fn with_documents(mut self, documents: Vec<DocumentRef>) -> Self {
        self.documents = documents;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Immutable record of one lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub ticket: TicketId,
    /// Status the ticket was left in.
    pub status: TicketStatus,
    pub event: EventKind,
    pub actor: UserId,
    pub actor_role: Role,
    pub comment: Option<String>,
    pub payload: AuditPayload,
    pub recorded_at: DateTime<Utc>,
    /// Tie-breaker for entries sharing a timestamp.
    pub sequence: u64,
}

static AUDIT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

impl AuditEntry {
    pub fn new(
        ticket: &TicketId,
        status: TicketStatus,
        event: EventKind,
        actor: &Actor,
        comment: Option<String>,
        payload: AuditPayload,
    ) -> Self {
        Self {
            id: AuditEntryId::next(),
            ticket: ticket.clone(),
            status,
            event,
            actor: actor.user.clone(),
            actor_role: actor.role,
            comment,
            payload,
            recorded_at: Utc::now(),
            sequence: AUDIT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Order entries chronologically.
pub fn chronological(mut entries: Vec<AuditEntry>) -> Vec<AuditEntry> {
    entries.sort_by(|a, b| {
        a.recorded_at
            .cmp(&b.recorded_at)
            .then(a.sequence.cmp(&b.sequence))
    });
    entries
}

/// Status sequence a ticket went through according to its entries.
pub fn status_trail(entries: &[AuditEntry]) -> Vec<TicketStatus> {
    let mut trail: Vec<TicketStatus> = Vec::new();
    for entry in chronological(entries.to_vec()) {
        if trail.last() != Some(&entry.status) {
            trail.push(entry.status);
        }
    }
    trail
}

/// The status replaying the entries yields.
pub fn replay_status(entries: &[AuditEntry]) -> Option<TicketStatus> {
    status_trail(entries).last().copied()
}

/// Read/append facade over an [`AuditTrail`].
pub struct AuditLog<T: ?Sized> {
    trail: Arc<T>,
}

impl<T: ?Sized> Clone for AuditLog<T> {
    fn clone(&self) -> Self {
        Self {
            trail: Arc::clone(&self.trail),
        }
    }
}

impl<T> AuditLog<T>
where
    T: AuditTrail + ?Sized,
{
    pub fn new(trail: Arc<T>) -> Self {
        Self { trail }
    }

    /// Append a standalone entry outside a lifecycle commit.
    pub fn record(
        &self,
        ticket: &TicketId,
        status: TicketStatus,
        event: EventKind,
        actor: &Actor,
        comment: Option<String>,
        payload: AuditPayload,
    ) -> Result<AuditEntry, RepositoryError> {
        let entry = AuditEntry::new(ticket, status, event, actor, comment, payload);
        self.trail.append(entry.clone())?;
        Ok(entry)
    }

    pub fn entry(&self, id: &AuditEntryId) -> Result<Option<AuditEntry>, RepositoryError> {
        self.trail.entry(id)
    }

    pub fn history(&self, ticket: &TicketId) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(chronological(self.trail.for_ticket(ticket)?))
    }

    pub fn by_actor(&self, user: &UserId) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(chronological(self.trail.by_actor(user)?))
    }
}
