use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::status::TicketStatus;

macro_rules! sequenced_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Issue the next identifier from the process-wide sequence.
            pub fn next() -> Self {
                use std::sync::atomic::{AtomicU64, Ordering};
                static SEQUENCE: AtomicU64 = AtomicU64::new(1);
                let id = SEQUENCE.fetch_add(1, Ordering::Relaxed);
                Self(format!(concat!($prefix, "-{:06}"), id))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

sequenced_id!(
    /// Identifier of a damage report.
    TicketId,
    "dmg"
);
sequenced_id!(OfferRequestId, "req");
sequenced_id!(OfferId, "ofr");
sequenced_id!(
    /// Audit entry id; doubles as the event id notifications are keyed on.
    AuditEntryId,
    "evt"
);
sequenced_id!(NotificationId, "ntf");
sequenced_id!(MessageId, "msg");

/// Identifier of a platform user, issued by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a registered repair company.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompanyId(pub String);

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rentable unit the ticket was raised against.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub String);

/// Opaque reference into the document/folder store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef(pub String);

/// Role a user acts in for one call. Threaded explicitly through every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Reporter,
    Owner,
    Administrator,
    Janitor,
    Company,
}

impl Role {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Reporter => "reporter",
            Self::Owner => "owner",
            Self::Administrator => "administrator",
            Self::Janitor => "janitor",
            Self::Company => "company",
        }
    }
}

/// The acting `(user, role)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub user: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user: impl Into<String>, role: Role) -> Self {
        Self {
            user: UserId(user.into()),
            role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locale {
    De,
    En,
}

/// Text carried in both supported languages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedText {
    pub de: String,
    pub en: String,
}

impl LocalizedText {
    pub fn new(de: impl Into<String>, en: impl Into<String>) -> Self {
        Self {
            de: de.into(),
            en: en.into(),
        }
    }

    pub fn get(&self, locale: Locale) -> &str {
        match locale {
            Locale::De => &self.de,
            Locale::En => &self.en,
        }
    }
}

/// Records that can carry references into the document store.
pub trait HasAttachableDocument {
    fn documents(&self) -> &[DocumentRef];
    fn attach(&mut self, document: DocumentRef);
}

/// Reporter-supplied description of the fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketDetails {
    pub unit: UnitId,
    pub title: String,
    pub description: String,
    /// Free text such as "2nd floor, kitchen".
    pub location: String,
    pub device_affected: bool,
    pub signature_required: bool,
    #[serde(default)]
    pub documents: Vec<DocumentRef>,
}

/// A damage report. Only lifecycle operations mutate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub unit: UnitId,
    pub title: String,
    pub description: String,
    pub location: String,
    pub device_affected: bool,
    pub signature_required: bool,
    pub status: TicketStatus,
    /// Set by `mark_repaired` without a signature on a signature-required ticket.
    pub signature_pending: bool,
    pub assignee: Option<CompanyId>,
    pub preferred_company: Option<CompanyId>,
    pub owner: UserId,
    pub responsible_role: Role,
    pub parent: Option<TicketId>,
    pub allocated: bool,
    pub deleted: bool,
    pub repair_date: Option<NaiveDate>,
    pub documents: Vec<DocumentRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every committed write.
    pub version: u64,
}

impl Ticket {
    pub fn open(details: TicketDetails, owner: &Actor, parent: Option<TicketId>) -> Self {
        let now = Utc::now();
        let mut ticket = Self {
            id: TicketId::next(),
            unit: details.unit,
            title: details.title,
            description: details.description,
            location: details.location,
            device_affected: details.device_affected,
            signature_required: details.signature_required,
            status: TicketStatus::Open,
            signature_pending: false,
            assignee: None,
            preferred_company: None,
            owner: owner.user.clone(),
            responsible_role: owner.role,
            parent,
            allocated: false,
            deleted: false,
            repair_date: None,
            documents: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        for document in details.documents {
            ticket.attach(document);
        }
        ticket
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl HasAttachableDocument for Ticket {
    fn documents(&self) -> &[DocumentRef] {
        &self.documents
    }

    fn attach(&mut self, document: DocumentRef) {
        if !self.documents.contains(&document) {
            self.documents.push(document);
        }
    }
}

/// Whether `assign_company` names the company that will do the work or only a preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    Preferred,
    Assigned,
}

/// Addressee of a solicitation: a registered company or a bare e-mail address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferTarget {
    Registered(CompanyId),
    Unregistered { email: String },
}

impl OfferTarget {
    pub fn key(&self) -> CompanyKey {
        match self {
            Self::Registered(company) => CompanyKey::Registered(company.clone()),
            Self::Unregistered { email } => CompanyKey::Email(email.trim().to_ascii_lowercase()),
        }
    }
}

/// Identity used for the one-open-request-per-company rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyKey {
    Registered(CompanyId),
    Email(String),
}

impl fmt::Display for CompanyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered(company) => write!(f, "{company}"),
            Self::Email(email) => write!(f, "<{email}>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferRequestStatus {
    Requested,
    OfferSubmitted,
    Rejected,
    Superseded,
}

/// A solicitation sent to one company for one ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRequest {
    pub id: OfferRequestId,
    pub ticket: TicketId,
    pub company: Option<CompanyId>,
    /// E-mail captured when the request was sent.
    pub contact_email: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub re_requested_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub status: OfferRequestStatus,
    pub comment: Option<String>,
}

impl OfferRequest {
    pub fn company_key(&self) -> CompanyKey {
        match (&self.company, &self.contact_email) {
            (Some(company), _) => CompanyKey::Registered(company.clone()),
            (None, Some(email)) => CompanyKey::Email(email.trim().to_ascii_lowercase()),
            (None, None) => CompanyKey::Email(String::new()),
        }
    }

    /// Neither declined by the company nor replaced by a newer request.
    pub fn is_open(&self) -> bool {
        self.rejected_at.is_none()
            && !matches!(
                self.status,
                OfferRequestStatus::Rejected | OfferRequestStatus::Superseded
            )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCategory {
    Labour,
    Material,
    Travel,
    Disposal,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub label: String,
    pub amount: u64,
}

/// What a company submits. Amounts are minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bid {
    pub description: String,
    pub total: u64,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub price_split: BTreeMap<CostCategory, u64>,
    #[serde(default)]
    pub document: Option<DocumentRef>,
    /// Pin the bid to a specific solicitation.
    #[serde(default)]
    pub request: Option<OfferRequestId>,
}

impl Bid {
    pub fn new(description: impl Into<String>, total: u64) -> Self {
        Self {
            description: description.into(),
            total,
            ..Self::default()
        }
    }

    /// Describe the first structural problem, if any.
    pub fn defect(&self) -> Option<String> {
        if self.description.trim().is_empty() {
            return Some("bid description must not be empty".to_string());
        }
        if self.total == 0 {
            return Some("bid total must be greater than zero".to_string());
        }
        if !self.line_items.is_empty() {
            let Some(sum) = checked_sum(self.line_items.iter().map(|item| item.amount)) else {
                return Some("line items exceed the largest representable amount".to_string());
            };
            if sum != self.total {
                return Some(format!(
                    "line items sum to {sum} but the bid total is {}",
                    self.total
                ));
            }
            if self.line_items.iter().any(|item| item.label.trim().is_empty()) {
                return Some("every line item needs a label".to_string());
            }
        }
        if !self.price_split.is_empty() {
            let Some(sum) = checked_sum(self.price_split.values().copied()) else {
                return Some("price split exceeds the largest representable amount".to_string());
            };
            if sum != self.total {
                return Some(format!(
                    "price split sums to {sum} but the bid total is {}",
                    self.total
                ));
            }
        }
        None
    }
}

fn checked_sum(mut amounts: impl Iterator<Item = u64>) -> Option<u64> {
    amounts.try_fold(0u64, |acc, amount| acc.checked_add(amount))
}

/// A company's bid against a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub ticket: TicketId,
    pub company: CompanyId,
    pub request: Option<OfferRequestId>,
    pub description: String,
    pub total: u64,
    pub line_items: Vec<LineItem>,
    pub price_split: BTreeMap<CostCategory, u64>,
    pub documents: Vec<DocumentRef>,
    pub accepted: bool,
    /// The single binding offer of the ticket.
    pub active: bool,
    pub accepted_at: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
}

impl HasAttachableDocument for Offer {
    fn documents(&self) -> &[DocumentRef] {
        &self.documents
    }

    fn attach(&mut self, document: DocumentRef) {
        if !self.documents.contains(&document) {
            self.documents.push(document);
        }
    }
}

/// Post-closure satisfaction score, one per (company, ticket).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRating {
    pub company: CompanyId,
    pub ticket: TicketId,
    pub rater: UserId,
    pub score: u8,
    pub rated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bid_defects_cover_malformed_breakdowns() {
        assert!(Bid::new("Replace boiler valve", 500).defect().is_none());
        assert!(Bid::new("  ", 500).defect().is_some());
        assert!(Bid::new("Replace valve", 0).defect().is_some());

        let mut itemized = Bid::new("Replace valve", 500);
        itemized.line_items = vec![
            LineItem {
                label: "Valve".to_string(),
                amount: 320,
            },
            LineItem {
                label: "Labour".to_string(),
                amount: 150,
            },
        ];
        let defect = itemized.defect().expect("sum mismatch reported");
        assert!(defect.contains("470"));

        let mut split = Bid::new("Replace valve", 500);
        split.price_split.insert(CostCategory::Labour, 200);
        split.price_split.insert(CostCategory::Material, 300);
        assert!(split.defect().is_none());
    }

    #[test]
    fn overflowing_breakdowns_are_defects_not_wraparounds() {
        let mut itemized = Bid::new("Replace valve", 1);
        itemized.line_items = vec![
            LineItem {
                label: "Valve".to_string(),
                amount: u64::MAX,
            },
            LineItem {
                label: "Labour".to_string(),
                amount: 2,
            },
        ];
        let defect = itemized.defect().expect("overflow reported");
        assert!(defect.contains("line items"));

        let mut split = Bid::new("Replace valve", 1);
        split.price_split.insert(CostCategory::Labour, u64::MAX);
        split.price_split.insert(CostCategory::Material, 2);
        let defect = split.defect().expect("overflow reported");
        assert!(defect.contains("price split"));
    }

    #[test]
    fn unregistered_targets_compare_case_insensitively() {
        let a = OfferTarget::Unregistered {
            email: "Info@Sanitaer.ch ".to_string(),
        };
        let b = OfferTarget::Unregistered {
            email: "info@sanitaer.ch".to_string(),
        };
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn ticket_ids_are_unique_and_prefixed() {
        let first = TicketId::next();
        let second = TicketId::next();
        assert_ne!(first, second);
        assert!(first.0.starts_with("dmg-"));
    }
}
