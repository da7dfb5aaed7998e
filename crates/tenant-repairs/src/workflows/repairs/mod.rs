//! Damage report workflow: lifecycle state machine, offer negotiation, audit trail,
//! notification fan-out and company ratings.
//!
//! Records reference each other by id only; the storage traits in [`repository`] resolve
//! them. [`service::RepairService`] is the entry point callers use.

pub mod audit;
pub mod directory;
pub mod domain;
pub mod error;
pub mod memory;
pub mod negotiation;
pub mod notifications;
pub mod rating;
pub mod repository;
pub mod service;
pub mod status;

#[cfg(test)]
mod tests;

pub use audit::{AuditEntry, AuditLog, AuditPayload, EventKind};
pub use directory::{
    Action, CompanyDirectory, DirectoryError, IdentityResolver, PermissionPolicy,
    SubscriptionGate, TicketContext, UnitDirectory, UnitResponsibles,
};
pub use domain::{
    Actor, AssignmentKind, AuditEntryId, Bid, CompanyId, CompanyKey, CompanyRating, CostCategory,
    DocumentRef, HasAttachableDocument, LineItem, Locale, LocalizedText, MessageId,
    NotificationId, Offer, OfferId, OfferRequest, OfferRequestId, OfferRequestStatus,
    OfferTarget, Role, Ticket, TicketDetails, TicketId, UnitId, UserId,
};
pub use error::{RepairError, TransportFailure};
pub use memory::{InMemoryDirectory, InMemoryRepairStore};
pub use negotiation::OfferNegotiation;
pub use notifications::{
    Addressee, Delivery, DeliveryReceipt, FanOutEvent, FanOutReport, Notification,
    NotificationCenter, NotificationTransport, ReadReceipt, Recipient, ThreadMessage,
    TracingTransport, TransportError,
};
pub use rating::{RatingBook, Reputation};
pub use repository::{
    AuditTrail, CommitBatch, NotificationStore, RatingStore, RepairRepository, RepairStore,
    RepositoryError, TicketWrite,
};
pub use service::{Collaborators, RepairService, TransitionOutcome};
pub use status::{allowed_next, Operation, StatusCatalog, StatusDefinition, TicketStatus};
