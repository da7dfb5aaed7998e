//! In-process backends: a single-mutex store implementing every storage trait, and a
//! directory implementing the identity, unit, company and billing collaborators.
//!
//! Used by the demo binary and the test suites.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;

use super::audit::AuditEntry;
use super::directory::{
    Action, CompanyDirectory, DirectoryError, IdentityResolver, PermissionPolicy, SubscriptionGate,
    TicketContext, UnitDirectory, UnitResponsibles,
};
use super::domain::{
    AuditEntryId, CompanyId, CompanyKey, CompanyRating, Locale, MessageId, NotificationId, Offer,
    OfferId, OfferRequest, OfferRequestId, Role, Ticket, TicketId, UnitId, UserId,
};
use super::notifications::{Notification, ReadReceipt, Recipient, ThreadMessage};
use super::repository::{
    AuditTrail, CommitBatch, NotificationStore, RatingStore, RepairRepository, RepositoryError,
};

#[derive(Default)]
struct StoreState {
    tickets: HashMap<TicketId, Ticket>,
    requests: HashMap<OfferRequestId, OfferRequest>,
    offers: HashMap<OfferId, Offer>,
    audit: Vec<AuditEntry>,
    notifications: HashMap<NotificationId, Notification>,
    notification_keys: HashMap<(AuditEntryId, Recipient), NotificationId>,
    messages: HashMap<MessageId, ThreadMessage>,
    receipts: Vec<ReadReceipt>,
    ratings: HashMap<(CompanyId, TicketId), CompanyRating>,
}

/// Every storage trait behind one mutex, so a [`CommitBatch`] is trivially atomic.
#[derive(Default, Clone)]
pub struct InMemoryRepairStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryRepairStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("repair store mutex poisoned".to_string()))
    }

    /// Every audit entry in insertion order.
    pub fn audit_entries(&self) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(self.lock()?.audit.clone())
    }

    pub fn tickets(&self) -> Result<Vec<Ticket>, RepositoryError> {
        let mut tickets: Vec<Ticket> = self.lock()?.tickets.values().cloned().collect();
        tickets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tickets)
    }

    pub fn notifications(&self) -> Result<Vec<Notification>, RepositoryError> {
        let mut rows: Vec<Notification> = self.lock()?.notifications.values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }
}

impl RepairRepository for InMemoryRepairStore {
    fn ticket(&self, id: &TicketId) -> Result<Option<Ticket>, RepositoryError> {
        Ok(self.lock()?.tickets.get(id).cloned())
    }

    fn children(&self, parent: &TicketId) -> Result<Vec<Ticket>, RepositoryError> {
        let guard = self.lock()?;
        let mut children: Vec<Ticket> = guard
            .tickets
            .values()
            .filter(|ticket| ticket.parent.as_ref() == Some(parent))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children)
    }

    fn offer_request(&self, id: &OfferRequestId) -> Result<Option<OfferRequest>, RepositoryError> {
        Ok(self.lock()?.requests.get(id).cloned())
    }

    fn offer_requests(&self, ticket: &TicketId) -> Result<Vec<OfferRequest>, RepositoryError> {
        let guard = self.lock()?;
        let mut requests: Vec<OfferRequest> = guard
            .requests
            .values()
            .filter(|request| &request.ticket == ticket)
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }

    fn offer(&self, id: &OfferId) -> Result<Option<Offer>, RepositoryError> {
        Ok(self.lock()?.offers.get(id).cloned())
    }

    fn offers(&self, ticket: &TicketId) -> Result<Vec<Offer>, RepositoryError> {
        let guard = self.lock()?;
        let mut offers: Vec<Offer> = guard
            .offers
            .values()
            .filter(|offer| &offer.ticket == ticket)
            .cloned()
            .collect();
        offers.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        Ok(offers)
    }

    fn commit(&self, batch: CommitBatch) -> Result<(), RepositoryError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let mut tickets = HashMap::new();
        for write in batch.tickets {
            let mut ticket = write.ticket;
            match (write.expected_version, state.tickets.get(&ticket.id)) {
                (None, Some(_)) => return Err(RepositoryError::Duplicate),
                (None, None) => {}
                (Some(_), None) => return Err(RepositoryError::NotFound),
                (Some(expected), Some(current)) if current.version != expected => {
                    return Err(RepositoryError::VersionConflict {
                        ticket: ticket.id.clone(),
                        expected,
                        actual: current.version,
                    });
                }
                (Some(expected), Some(_)) => ticket.version = expected + 1,
            }
            tickets.insert(ticket.id.clone(), ticket);
        }

        let mut touched: HashSet<TicketId> = HashSet::new();
        let mut requests = state.requests.clone();
        for request in batch.requests {
            touched.insert(request.ticket.clone());
            requests.insert(request.id.clone(), request);
        }
        let mut offers = state.offers.clone();
        for offer in batch.offers {
            touched.insert(offer.ticket.clone());
            offers.insert(offer.id.clone(), offer);
        }

        for ticket in &touched {
            let deleted = tickets
                .get(ticket)
                .or_else(|| state.tickets.get(ticket))
                .map(|ticket| ticket.deleted)
                .unwrap_or(false);
            if deleted {
                continue;
            }

            let active: Vec<&OfferId> = offers
                .values()
                .filter(|offer| &offer.ticket == ticket && offer.active)
                .map(|offer| &offer.id)
                .collect();
            if active.len() > 1 {
                let incumbent = active
                    .iter()
                    .find(|id| state.offers.get(**id).map(|o| o.active).unwrap_or(false))
                    .unwrap_or(&active[0]);
                return Err(RepositoryError::ActiveOfferConflict {
                    ticket: ticket.clone(),
                    active: (*incumbent).clone(),
                });
            }

            let mut open: HashSet<CompanyKey> = HashSet::new();
            for request in requests
                .values()
                .filter(|request| &request.ticket == ticket && request.is_open())
            {
                if !open.insert(request.company_key()) {
                    return Err(RepositoryError::OpenRequestConflict {
                        ticket: ticket.clone(),
                        company: request.company_key(),
                    });
                }
            }
        }

        state.tickets.extend(tickets);
        state.requests = requests;
        state.offers = offers;
        state.audit.extend(batch.audit);
        Ok(())
    }
}

impl AuditTrail for InMemoryRepairStore {
    fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        let mut guard = self.lock()?;
        if guard.audit.iter().any(|existing| existing.id == entry.id) {
            return Err(RepositoryError::Duplicate);
        }
        guard.audit.push(entry);
        Ok(())
    }

    fn entry(&self, id: &AuditEntryId) -> Result<Option<AuditEntry>, RepositoryError> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .find(|entry| &entry.id == id)
            .cloned())
    }

    fn for_ticket(&self, ticket: &TicketId) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .filter(|entry| &entry.ticket == ticket)
            .cloned()
            .collect())
    }

    fn by_actor(&self, user: &UserId) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .filter(|entry| &entry.actor == user)
            .cloned()
            .collect())
    }
}

impl NotificationStore for InMemoryRepairStore {
    fn insert_notification(&self, notification: Notification) -> Result<bool, RepositoryError> {
        let mut guard = self.lock()?;
        let key = (notification.event.clone(), notification.recipient.clone());
        if guard.notification_keys.contains_key(&key) {
            return Ok(false);
        }
        guard.notification_keys.insert(key, notification.id.clone());
        guard
            .notifications
            .insert(notification.id.clone(), notification);
        Ok(true)
    }

    fn notification(&self, id: &NotificationId) -> Result<Option<Notification>, RepositoryError> {
        Ok(self.lock()?.notifications.get(id).cloned())
    }

    fn find_notification(
        &self,
        event: &AuditEntryId,
        recipient: &Recipient,
    ) -> Result<Option<Notification>, RepositoryError> {
        let guard = self.lock()?;
        Ok(guard
            .notification_keys
            .get(&(event.clone(), recipient.clone()))
            .and_then(|id| guard.notifications.get(id))
            .cloned())
    }

    fn notifications_for(&self, user: &UserId) -> Result<Vec<Notification>, RepositoryError> {
        Ok(self
            .lock()?
            .notifications
            .values()
            .filter(|row| row.recipient.is_user(user))
            .cloned()
            .collect())
    }

    fn set_notification_read(&self, id: &NotificationId, read: bool) -> Result<(), RepositoryError> {
        let mut guard = self.lock()?;
        let row = guard
            .notifications
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;
        row.read = read;
        Ok(())
    }

    fn mark_delivered(&self, id: &NotificationId) -> Result<(), RepositoryError> {
        let mut guard = self.lock()?;
        let row = guard
            .notifications
            .get_mut(id)
            .ok_or(RepositoryError::NotFound)?;
        row.delivered = true;
        Ok(())
    }

    fn insert_message(
        &self,
        message: ThreadMessage,
        receipts: Vec<ReadReceipt>,
    ) -> Result<(), RepositoryError> {
        let mut guard = self.lock()?;
        if guard.messages.contains_key(&message.id) {
            return Err(RepositoryError::Duplicate);
        }
        guard.messages.insert(message.id.clone(), message);
        guard.receipts.extend(receipts);
        Ok(())
    }

    fn message(&self, id: &MessageId) -> Result<Option<ThreadMessage>, RepositoryError> {
        Ok(self.lock()?.messages.get(id).cloned())
    }

    fn receipts(&self, message: &MessageId) -> Result<Vec<ReadReceipt>, RepositoryError> {
        Ok(self
            .lock()?
            .receipts
            .iter()
            .filter(|receipt| &receipt.message == message)
            .cloned()
            .collect())
    }

    fn set_receipt_read(
        &self,
        message: &MessageId,
        user: &UserId,
        role: Role,
    ) -> Result<(), RepositoryError> {
        let mut guard = self.lock()?;
        let receipt = guard
            .receipts
            .iter_mut()
            .find(|receipt| &receipt.message == message && &receipt.user == user && receipt.role == role)
            .ok_or(RepositoryError::NotFound)?;
        if !receipt.read {
            receipt.read = true;
            receipt.read_at = Some(Utc::now());
        }
        Ok(())
    }

    fn unread_receipts(&self, user: &UserId, role: Role) -> Result<Vec<ReadReceipt>, RepositoryError> {
        Ok(self
            .lock()?
            .receipts
            .iter()
            .filter(|receipt| &receipt.user == user && receipt.role == role && !receipt.read)
            .cloned()
            .collect())
    }
}

impl RatingStore for InMemoryRepairStore {
    fn insert_rating(&self, rating: CompanyRating) -> Result<(), RepositoryError> {
        let mut guard = self.lock()?;
        let key = (rating.company.clone(), rating.ticket.clone());
        if guard.ratings.contains_key(&key) {
            return Err(RepositoryError::Duplicate);
        }
        guard.ratings.insert(key, rating);
        Ok(())
    }

    fn rating(
        &self,
        company: &CompanyId,
        ticket: &TicketId,
    ) -> Result<Option<CompanyRating>, RepositoryError> {
        Ok(self
            .lock()?
            .ratings
            .get(&(company.clone(), ticket.clone()))
            .cloned())
    }

    fn ratings_for_company(&self, company: &CompanyId) -> Result<Vec<CompanyRating>, RepositoryError> {
        let guard = self.lock()?;
        let mut ratings: Vec<CompanyRating> = guard
            .ratings
            .values()
            .filter(|rating| &rating.company == company)
            .cloned()
            .collect();
        ratings.sort_by(|a, b| a.rated_at.cmp(&b.rated_at));
        Ok(ratings)
    }
}

#[derive(Debug, Clone, Default)]
struct CompanyRecord {
    email: Option<String>,
    members: Vec<UserId>,
}

#[derive(Default)]
struct DirectoryState {
    units: HashMap<UnitId, UnitResponsibles>,
    companies: HashMap<CompanyId, CompanyRecord>,
    roles: HashMap<UserId, BTreeSet<Role>>,
    locales: HashMap<UserId, Locale>,
    suspended: HashSet<UnitId>,
    policy: PermissionPolicy,
}

/// Directory backed by in-process tables, configured with the builder methods.
#[derive(Default, Clone)]
pub struct InMemoryDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self, apply: impl FnOnce(&mut DirectoryState)) {
        // tables stay consistent across a panicked writer
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
    }

    fn read<T>(&self, query: impl FnOnce(&DirectoryState) -> T) -> T {
        let guard = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        query(&guard)
    }

    /// Register a unit with its owners, administrators and janitors.
    pub fn with_unit(self, unit: &str, responsibles: UnitResponsibles) -> Self {
        self.write(|state| {
            for (user, role) in responsibles.with_roles() {
                state.roles.entry(user).or_default().insert(role);
            }
            state.units.insert(UnitId(unit.to_string()), responsibles);
        });
        self
    }

    pub fn with_company(self, company: &str, email: Option<&str>, members: &[&str]) -> Self {
        self.write(|state| {
            let members: Vec<UserId> = members.iter().map(|m| UserId(m.to_string())).collect();
            for member in &members {
                state.roles.entry(member.clone()).or_default().insert(Role::Company);
            }
            state.companies.insert(
                CompanyId(company.to_string()),
                CompanyRecord {
                    email: email.map(str::to_string),
                    members,
                },
            );
        });
        self
    }

    /// Allow `user` to act as a reporter.
    pub fn with_reporter(self, user: &str) -> Self {
        self.write(|state| {
            state
                .roles
                .entry(UserId(user.to_string()))
                .or_default()
                .insert(Role::Reporter);
        });
        self
    }

    pub fn with_locale(self, user: &str, locale: Locale) -> Self {
        self.write(|state| {
            state.locales.insert(UserId(user.to_string()), locale);
        });
        self
    }

    pub fn suspend(&self, unit: &str) {
        self.write(|state| {
            state.suspended.insert(UnitId(unit.to_string()));
        });
    }

    pub fn revoke(&self, role: Role, action: Action) {
        self.write(|state| state.policy.revoke(role, action));
    }
}

impl IdentityResolver for InMemoryDirectory {
    fn role_of(&self, user: &UserId, context: &TicketContext) -> Option<Role> {
        self.read(|state| {
            if let Some(responsibles) = state.units.get(&context.unit) {
                if let Some((_, role)) = responsibles
                    .with_roles()
                    .into_iter()
                    .find(|(candidate, _)| candidate == user)
                {
                    return Some(role);
                }
            }
            if context.owner.as_ref() == Some(user) {
                return Some(Role::Reporter);
            }
            state
                .companies
                .values()
                .any(|record| record.members.contains(user))
                .then_some(Role::Company)
        })
    }

    fn has_permission(&self, user: &UserId, role: Role, action: Action) -> bool {
        self.read(|state| {
            let holds = state
                .roles
                .get(user)
                .map(|roles| roles.contains(&role))
                .unwrap_or(false);
            holds && state.policy.allows(role, action)
        })
    }

    fn locale_of(&self, user: &UserId) -> Locale {
        self.read(|state| state.locales.get(user).copied().unwrap_or(Locale::De))
    }
}

impl UnitDirectory for InMemoryDirectory {
    fn responsibles(&self, unit: &UnitId) -> Result<UnitResponsibles, DirectoryError> {
        self.read(|state| {
            state
                .units
                .get(unit)
                .cloned()
                .ok_or_else(|| DirectoryError::UnknownUnit(unit.clone()))
        })
    }
}

impl CompanyDirectory for InMemoryDirectory {
    fn company_of(&self, user: &UserId) -> Option<CompanyId> {
        self.read(|state| {
            state
                .companies
                .iter()
                .find(|(_, record)| record.members.contains(user))
                .map(|(company, _)| company.clone())
        })
    }

    fn members(&self, company: &CompanyId) -> Vec<UserId> {
        self.read(|state| {
            state
                .companies
                .get(company)
                .map(|record| record.members.clone())
                .unwrap_or_default()
        })
    }

    fn contact_email(&self, company: &CompanyId) -> Option<String> {
        self.read(|state| state.companies.get(company).and_then(|record| record.email.clone()))
    }

    fn exists(&self, company: &CompanyId) -> bool {
        self.read(|state| state.companies.contains_key(company))
    }
}

impl SubscriptionGate for InMemoryDirectory {
    fn is_active(&self, unit: &UnitId) -> bool {
        self.read(|state| state.units.contains_key(unit) && !state.suspended.contains(unit))
    }
}
