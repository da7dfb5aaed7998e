use serde::Serialize;

use super::domain::{CompanyId, CompanyKey, OfferId, Role, TicketId, UserId};
use super::repository::RepositoryError;
use super::status::{Operation, TicketStatus};

/// Failure of a lifecycle, negotiation, notification, or rating operation.
///
/// Everything except `Repository` is raised in the guard phase, before any write.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("{operation} is not allowed on ticket {ticket} in status {current} (allowed next: {allowed:?})")]
    InvalidTransition {
        ticket: TicketId,
        operation: Operation,
        current: TicketStatus,
        allowed: Vec<TicketStatus>,
    },
    #[error("{user} acting as {role:?} may not {operation}{}", ticket_suffix(.ticket))]
    Unauthorized {
        ticket: Option<TicketId>,
        operation: Operation,
        user: UserId,
        role: Role,
    },
    #[error("ticket {ticket} already has active offer {active}; {operation} would leave two active")]
    ConflictingActiveOffer {
        ticket: TicketId,
        operation: Operation,
        active: OfferId,
    },
    #[error("ticket {ticket} already has an open offer request for {company} ({operation})")]
    DuplicateOpenRequest {
        ticket: TicketId,
        operation: Operation,
        company: CompanyKey,
    },
    #[error("company {company} was already rated for ticket {ticket}")]
    AlreadyRated { ticket: TicketId, company: CompanyId },
    #[error("{entity} {id} not found ({operation})")]
    NotFound {
        ticket: Option<TicketId>,
        operation: Operation,
        entity: &'static str,
        id: String,
    },
    #[error("{operation} rejected{}: {reason}", ticket_suffix(.ticket))]
    Validation {
        ticket: Option<TicketId>,
        operation: Operation,
        reason: String,
    },
    #[error("{operation} could not be stored{}: {source}", ticket_suffix(.ticket))]
    Repository {
        ticket: Option<TicketId>,
        operation: Operation,
        #[source]
        source: RepositoryError,
    },
}

fn ticket_suffix(ticket: &Option<TicketId>) -> String {
    match ticket {
        Some(id) => format!(" on ticket {id}"),
        None => String::new(),
    }
}

impl RepairError {
    pub fn operation(&self) -> Operation {
        match self {
            Self::InvalidTransition { operation, .. }
            | Self::Unauthorized { operation, .. }
            | Self::ConflictingActiveOffer { operation, .. }
            | Self::DuplicateOpenRequest { operation, .. }
            | Self::NotFound { operation, .. }
            | Self::Validation { operation, .. }
            | Self::Repository { operation, .. } => *operation,
            Self::AlreadyRated { .. } => Operation::Rate,
        }
    }

    pub fn ticket(&self) -> Option<&TicketId> {
        match self {
            Self::InvalidTransition { ticket, .. }
            | Self::ConflictingActiveOffer { ticket, .. }
            | Self::DuplicateOpenRequest { ticket, .. }
            | Self::AlreadyRated { ticket, .. } => Some(ticket),
            Self::Unauthorized { ticket, .. }
            | Self::NotFound { ticket, .. }
            | Self::Validation { ticket, .. }
            | Self::Repository { ticket, .. } => ticket.as_ref(),
        }
    }

    pub(crate) fn validation(
        ticket: Option<&TicketId>,
        operation: Operation,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            ticket: ticket.cloned(),
            operation,
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(
        ticket: Option<&TicketId>,
        operation: Operation,
        entity: &'static str,
        id: impl ToString,
    ) -> Self {
        Self::NotFound {
            ticket: ticket.cloned(),
            operation,
            entity,
            id: id.to_string(),
        }
    }

    /// Wrap a storage failure, translating invariant rejections into their typed variants.
    pub(crate) fn from_repository(
        ticket: Option<&TicketId>,
        operation: Operation,
        source: RepositoryError,
    ) -> Self {
        match source {
            RepositoryError::ActiveOfferConflict { ticket, active } => {
                Self::ConflictingActiveOffer {
                    ticket,
                    operation,
                    active,
                }
            }
            RepositoryError::OpenRequestConflict { ticket, company } => {
                Self::DuplicateOpenRequest {
                    ticket,
                    operation,
                    company,
                }
            }
            source => Self::Repository {
                ticket: ticket.cloned(),
                operation,
                source,
            },
        }
    }
}

/// Non-fatal delivery problem attached to an otherwise successful outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportFailure {
    pub ticket: Option<TicketId>,
    pub operation: Operation,
    pub recipient: String,
    pub reason: String,
}
