use std::fmt;

use serde::{Deserialize, Serialize};

use super::domain::LocalizedText;
use crate::config::RepairConfig;

/// Lifecycle stage of a damage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    AllocationPending,
    OfferRequested,
    OfferReceived,
    OfferAccepted,
    RepairScheduled,
    RepairConfirmed,
    Closed,
    Rejected,
    Cancelled,
    /// Work was split into child tickets.
    Delegated,
}

impl TicketStatus {
    pub const fn ordered() -> [Self; 11] {
        [
            Self::Open,
            Self::AllocationPending,
            Self::OfferRequested,
            Self::OfferReceived,
            Self::OfferAccepted,
            Self::RepairScheduled,
            Self::RepairConfirmed,
            Self::Closed,
            Self::Rejected,
            Self::Cancelled,
            Self::Delegated,
        ]
    }

    pub const fn key(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::AllocationPending => "allocation_pending",
            Self::OfferRequested => "offer_requested",
            Self::OfferReceived => "offer_received",
            Self::OfferAccepted => "offer_accepted",
            Self::RepairScheduled => "repair_scheduled",
            Self::RepairConfirmed => "repair_confirmed",
            Self::Closed => "closed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Delegated => "delegated",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_ascii_lowercase();
        Self::ordered()
            .into_iter()
            .find(|status| status.key() == key)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Rejected | Self::Cancelled | Self::Delegated
        )
    }

    fn label(self) -> LocalizedText {
        let (de, en) = match self {
            Self::Open => ("Offen", "Open"),
            Self::AllocationPending => ("Zuteilung ausstehend", "Allocation pending"),
            Self::OfferRequested => ("Offerte angefragt", "Offer requested"),
            Self::OfferReceived => ("Offerte erhalten", "Offer received"),
            Self::OfferAccepted => ("Offerte angenommen", "Offer accepted"),
            Self::RepairScheduled => ("Reparatur geplant", "Repair scheduled"),
            Self::RepairConfirmed => ("Reparatur bestätigt", "Repair confirmed"),
            Self::Closed => ("Abgeschlossen", "Closed"),
            Self::Rejected => ("Abgelehnt", "Rejected"),
            Self::Cancelled => ("Storniert", "Cancelled"),
            Self::Delegated => ("Aufgeteilt", "Delegated"),
        };
        LocalizedText::new(de, en)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Lifecycle operations, used for guards, errors, and tracing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    AssignCompany,
    RequestOffer,
    DeclineRequest,
    SubmitOffer,
    AcceptOffer,
    ScheduleRepair,
    MarkRepaired,
    ConfirmSignature,
    Close,
    Reject,
    Cancel,
    Split,
    Comment,
    Delete,
    Rate,
    MarkRead,
    PostMessage,
    Notify,
}

impl Operation {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::AssignCompany => "assign_company",
            Self::RequestOffer => "request_offer",
            Self::DeclineRequest => "decline_request",
            Self::SubmitOffer => "submit_offer",
            Self::AcceptOffer => "accept_offer",
            Self::ScheduleRepair => "schedule_repair",
            Self::MarkRepaired => "mark_repaired",
            Self::ConfirmSignature => "confirm_signature",
            Self::Close => "close",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::Split => "split",
            Self::Comment => "comment",
            Self::Delete => "delete",
            Self::Rate => "rate",
            Self::MarkRead => "mark_read",
            Self::PostMessage => "post_message",
            Self::Notify => "notify",
        }
    }

    /// Statuses the operation may start from.
    pub fn sources(self) -> Vec<TicketStatus> {
        use TicketStatus::*;
        let non_terminal = || {
            TicketStatus::ordered()
                .into_iter()
                .filter(|status| !status.is_terminal())
                .collect::<Vec<_>>()
        };
        match self {
            Self::Create => Vec::new(),
            Self::AssignCompany
            | Self::DeclineRequest
            | Self::Reject
            | Self::Cancel
            | Self::Split => non_terminal(),
            Self::RequestOffer => vec![AllocationPending, OfferRequested],
            Self::SubmitOffer => vec![AllocationPending, OfferRequested, OfferReceived, OfferAccepted],
            Self::AcceptOffer => vec![OfferReceived],
            Self::ScheduleRepair => vec![OfferAccepted, RepairScheduled],
            Self::MarkRepaired => vec![OfferAccepted, RepairScheduled],
            Self::ConfirmSignature | Self::Close => vec![RepairConfirmed],
            Self::Comment
            | Self::Delete
            | Self::Rate
            | Self::MarkRead
            | Self::PostMessage
            | Self::Notify => TicketStatus::ordered().to_vec(),
        }
    }

    /// Status a successful call leaves the ticket in; `None` keeps the current one.
    pub const fn target(self) -> Option<TicketStatus> {
        match self {
            Self::Create => Some(TicketStatus::Open),
            Self::AssignCompany => Some(TicketStatus::AllocationPending),
            Self::RequestOffer => Some(TicketStatus::OfferRequested),
            Self::SubmitOffer => Some(TicketStatus::OfferReceived),
            Self::AcceptOffer => Some(TicketStatus::OfferAccepted),
            Self::ScheduleRepair => Some(TicketStatus::RepairScheduled),
            Self::MarkRepaired | Self::ConfirmSignature => Some(TicketStatus::RepairConfirmed),
            Self::Close => Some(TicketStatus::Closed),
            Self::Reject => Some(TicketStatus::Rejected),
            Self::Cancel => Some(TicketStatus::Cancelled),
            Self::Split => Some(TicketStatus::Delegated),
            Self::DeclineRequest
            | Self::Comment
            | Self::Delete
            | Self::Rate
            | Self::MarkRead
            | Self::PostMessage
            | Self::Notify => None,
        }
    }

    pub fn permits(self, current: TicketStatus) -> bool {
        self.sources().contains(&current)
    }

    const STATE_CHANGING: [Self; 11] = [
        Self::AssignCompany,
        Self::RequestOffer,
        Self::SubmitOffer,
        Self::AcceptOffer,
        Self::ScheduleRepair,
        Self::MarkRepaired,
        Self::Close,
        Self::Reject,
        Self::Cancel,
        Self::Split,
        Self::Create,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Statuses reachable from `current` through any lifecycle operation.
pub fn allowed_next(current: TicketStatus) -> Vec<TicketStatus> {
    let mut next: Vec<TicketStatus> = Operation::STATE_CHANGING
        .into_iter()
        .filter(|operation| operation.permits(current))
        .filter_map(Operation::target)
        .collect();
    next.sort();
    next.dedup();
    next
}

/// Lookup row describing a status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusDefinition {
    pub status: TicketStatus,
    pub key: &'static str,
    pub label: LocalizedText,
    pub comment_required: bool,
}

/// The status lookup table, with comment rules taken from configuration.
#[derive(Debug, Clone)]
pub struct StatusCatalog {
    definitions: Vec<StatusDefinition>,
}

impl StatusCatalog {
    pub fn new(comment_required: &[TicketStatus]) -> Self {
        let definitions = TicketStatus::ordered()
            .into_iter()
            .map(|status| StatusDefinition {
                status,
                key: status.key(),
                label: status.label(),
                comment_required: comment_required.contains(&status),
            })
            .collect();
        Self { definitions }
    }

    pub fn from_config(config: &RepairConfig) -> Self {
        Self::new(&config.comment_required)
    }

    pub fn definition(&self, status: TicketStatus) -> &StatusDefinition {
        // the table is built from `TicketStatus::ordered()`, so the index always exists
        &self.definitions[status as usize]
    }

    pub fn comment_required(&self, status: TicketStatus) -> bool {
        self.definition(status).comment_required
    }

    pub fn definitions(&self) -> &[StatusDefinition] {
        &self.definitions
    }
}

impl Default for StatusCatalog {
    fn default() -> Self {
        Self::from_config(&RepairConfig::default())
    }
}
