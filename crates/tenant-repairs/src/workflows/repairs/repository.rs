use super::audit::AuditEntry;
use super::domain::{
    AuditEntryId, CompanyId, CompanyKey, CompanyRating, MessageId, NotificationId, Offer,
    OfferId, OfferRequest, OfferRequestId, Role, Ticket, TicketId, UserId,
};
use super::notifications::{Notification, ReadReceipt, Recipient, ThreadMessage};

/// Ticket write guarded by the version the writer read.
#[derive(Debug, Clone)]
pub struct TicketWrite {
    pub ticket: Ticket,
    /// `None` for inserts.
    pub expected_version: Option<u64>,
}

/// Everything one lifecycle operation persists. Applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub tickets: Vec<TicketWrite>,
    pub requests: Vec<OfferRequest>,
    pub offers: Vec<Offer>,
    pub audit: Vec<AuditEntry>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
            && self.requests.is_empty()
            && self.offers.is_empty()
            && self.audit.is_empty()
    }

    pub fn merge(&mut self, other: CommitBatch) {
        self.tickets.extend(other.tickets);
        self.requests.extend(other.requests);
        self.offers.extend(other.offers);
        self.audit.extend(other.audit);
    }
}

/// Storage for tickets and the negotiation records hanging off them.
///
/// Relationships are plain identifiers resolved through these lookups.
pub trait RepairRepository: Send + Sync {
    /// Includes soft-deleted tickets; callers filter.
    fn ticket(&self, id: &TicketId) -> Result<Option<Ticket>, RepositoryError>;
    fn children(&self, parent: &TicketId) -> Result<Vec<Ticket>, RepositoryError>;
    fn offer_request(&self, id: &OfferRequestId) -> Result<Option<OfferRequest>, RepositoryError>;
    fn offer_requests(&self, ticket: &TicketId) -> Result<Vec<OfferRequest>, RepositoryError>;
    fn offer(&self, id: &OfferId) -> Result<Option<Offer>, RepositoryError>;
    fn offers(&self, ticket: &TicketId) -> Result<Vec<Offer>, RepositoryError>;
    /// Apply the batch atomically, refusing stale versions and broken uniqueness rules.
    fn commit(&self, batch: CommitBatch) -> Result<(), RepositoryError>;
}

/// Append-only event history; entries are never updated or removed.
pub trait AuditTrail: Send + Sync {
    fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError>;
    fn entry(&self, id: &AuditEntryId) -> Result<Option<AuditEntry>, RepositoryError>;
    fn for_ticket(&self, ticket: &TicketId) -> Result<Vec<AuditEntry>, RepositoryError>;
    fn by_actor(&self, user: &UserId) -> Result<Vec<AuditEntry>, RepositoryError>;
}

/// Per-recipient notification rows plus shared thread messages with read receipts.
pub trait NotificationStore: Send + Sync {
    /// Returns `false` when a row for the same (event, recipient) already exists.
    fn insert_notification(&self, notification: Notification) -> Result<bool, RepositoryError>;
    fn notification(&self, id: &NotificationId) -> Result<Option<Notification>, RepositoryError>;
    fn find_notification(
        &self,
        event: &AuditEntryId,
        recipient: &Recipient,
    ) -> Result<Option<Notification>, RepositoryError>;
    fn notifications_for(&self, user: &UserId) -> Result<Vec<Notification>, RepositoryError>;
    fn set_notification_read(&self, id: &NotificationId, read: bool) -> Result<(), RepositoryError>;
    fn mark_delivered(&self, id: &NotificationId) -> Result<(), RepositoryError>;
    fn insert_message(
        &self,
        message: ThreadMessage,
        receipts: Vec<ReadReceipt>,
    ) -> Result<(), RepositoryError>;
    fn message(&self, id: &MessageId) -> Result<Option<ThreadMessage>, RepositoryError>;
    fn receipts(&self, message: &MessageId) -> Result<Vec<ReadReceipt>, RepositoryError>;
    fn set_receipt_read(
        &self,
        message: &MessageId,
        user: &UserId,
        role: Role,
    ) -> Result<(), RepositoryError>;
    fn unread_receipts(&self, user: &UserId, role: Role) -> Result<Vec<ReadReceipt>, RepositoryError>;
}

/// Company ratings with (company, ticket) uniqueness.
pub trait RatingStore: Send + Sync {
    /// Fails with `Duplicate` instead of overwriting.
    fn insert_rating(&self, rating: CompanyRating) -> Result<(), RepositoryError>;
    fn rating(
        &self,
        company: &CompanyId,
        ticket: &TicketId,
    ) -> Result<Option<CompanyRating>, RepositoryError>;
    fn ratings_for_company(&self, company: &CompanyId) -> Result<Vec<CompanyRating>, RepositoryError>;
}

/// A single backend serving every component.
pub trait RepairStore: RepairRepository + AuditTrail + NotificationStore + RatingStore {}

impl<T> RepairStore for T where T: RepairRepository + AuditTrail + NotificationStore + RatingStore {}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Duplicate,
    #[error("record not found")]
    NotFound,
    #[error("ticket {ticket} changed concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        ticket: TicketId,
        expected: u64,
        actual: u64,
    },
    #[error("ticket {ticket} would end up with a second active offer besides {active}")]
    ActiveOfferConflict { ticket: TicketId, active: OfferId },
    #[error("ticket {ticket} would end up with two open requests for {company}")]
    OpenRequestConflict { ticket: TicketId, company: CompanyKey },
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}
