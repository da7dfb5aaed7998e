//! Narrow interfaces onto the collaborators this core consumes but does not own: identity and
//! permissions, the property/unit directory, repair company records, and the billing gate.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::domain::{CompanyId, Locale, Role, TicketId, UnitId, UserId};

/// What a permission check is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateTicket,
    AssignCompany,
    RequestOffer,
    DeclineRequest,
    SubmitOffer,
    AcceptOffer,
    ScheduleRepair,
    MarkRepaired,
    ConfirmSignature,
    CloseTicket,
    RejectTicket,
    CancelTicket,
    SplitTicket,
    Comment,
    DeleteTicket,
    RateCompany,
    /// Receiving notifications about a ticket.
    ViewTicket,
}

/// Ticket facts the role resolver may take into account.
#[derive(Debug, Clone)]
pub struct TicketContext {
    pub ticket: Option<TicketId>,
    pub unit: UnitId,
    pub owner: Option<UserId>,
    pub assignee: Option<CompanyId>,
}

/// Identity/role collaborator.
pub trait IdentityResolver: Send + Sync {
    fn role_of(&self, user: &UserId, context: &TicketContext) -> Option<Role>;
    fn has_permission(&self, user: &UserId, role: Role, action: Action) -> bool;
    fn locale_of(&self, _user: &UserId) -> Locale {
        Locale::De
    }
}

/// People responsible for a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitResponsibles {
    pub owners: Vec<UserId>,
    pub administrators: Vec<UserId>,
    pub janitors: Vec<UserId>,
}

impl UnitResponsibles {
    pub fn with_roles(&self) -> Vec<(UserId, Role)> {
        let owners = self.owners.iter().map(|user| (user.clone(), Role::Owner));
        let administrators = self
            .administrators
            .iter()
            .map(|user| (user.clone(), Role::Administrator));
        let janitors = self.janitors.iter().map(|user| (user.clone(), Role::Janitor));
        owners.chain(administrators).chain(janitors).collect()
    }
}

/// Read-only property/unit directory.
pub trait UnitDirectory: Send + Sync {
    fn responsibles(&self, unit: &UnitId) -> Result<UnitResponsibles, DirectoryError>;
}

/// Registered repair companies and their users.
pub trait CompanyDirectory: Send + Sync {
    fn company_of(&self, user: &UserId) -> Option<CompanyId>;
    fn members(&self, company: &CompanyId) -> Vec<UserId>;
    fn contact_email(&self, company: &CompanyId) -> Option<String>;
    fn exists(&self, company: &CompanyId) -> bool;
}

/// Billing collaborator, consulted only before ticket creation.
pub trait SubscriptionGate: Send + Sync {
    fn is_active(&self, unit: &UnitId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("unit {0:?} is unknown to the property directory")]
    UnknownUnit(UnitId),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Default role → action table used by the bundled resolver.
#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    grants: BTreeMap<Role, BTreeSet<Action>>,
}

impl PermissionPolicy {
    pub fn standard() -> Self {
        use Action::*;

        let manager = [
            CreateTicket,
            AssignCompany,
            RequestOffer,
            AcceptOffer,
            ScheduleRepair,
            MarkRepaired,
            ConfirmSignature,
            CloseTicket,
            RejectTicket,
            CancelTicket,
            SplitTicket,
            Comment,
            DeleteTicket,
            RateCompany,
            ViewTicket,
        ];

        let mut grants = BTreeMap::new();
        grants.insert(Role::Owner, manager.into_iter().collect());
        grants.insert(Role::Administrator, manager.into_iter().collect());
        grants.insert(
            Role::Janitor,
            [CreateTicket, ScheduleRepair, MarkRepaired, Comment, ViewTicket]
                .into_iter()
                .collect(),
        );
        grants.insert(
            Role::Reporter,
            [CreateTicket, ConfirmSignature, CancelTicket, Comment, RateCompany, ViewTicket]
                .into_iter()
                .collect(),
        );
        grants.insert(
            Role::Company,
            [
                DeclineRequest,
                SubmitOffer,
                ScheduleRepair,
                MarkRepaired,
                Comment,
                ViewTicket,
            ]
            .into_iter()
            .collect(),
        );

        Self { grants }
    }

    pub fn allows(&self, role: Role, action: Action) -> bool {
        self.grants
            .get(&role)
            .map(|actions| actions.contains(&action))
            .unwrap_or(false)
    }

    pub fn revoke(&mut self, role: Role, action: Action) {
        if let Some(actions) = self.grants.get_mut(&role) {
            actions.remove(&action);
        }
    }
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
