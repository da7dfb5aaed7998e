//! The ticket lifecycle: every operation is guard → plan → atomic commit → fan-out.
//!
//! Guards and the commit run while the per-ticket lock is held. The commit carries the
//! ticket version the guard saw, so a writer sharing the store through another service
//! instance turns into a version conflict and the whole operation is re-planned. Fan-out
//! happens after the lock is released and can only add warnings to the outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use serde_json::json;
use tokio::sync::{Mutex as TicketLock, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::audit::{AuditEntry, AuditLog, AuditPayload, EventKind};
use super::directory::{
    Action, CompanyDirectory, IdentityResolver, SubscriptionGate, TicketContext, UnitDirectory,
};
use super::domain::{
    Actor, AssignmentKind, AuditEntryId, Bid, CompanyId, CompanyKey, CompanyRating, DocumentRef,
    HasAttachableDocument, Locale, MessageId, NotificationId, Offer, OfferId, OfferRequest,
    OfferRequestId, OfferRequestStatus, OfferTarget, Role, Ticket, TicketDetails, TicketId, UserId,
};
use super::error::{RepairError, TransportFailure};
use super::negotiation::OfferNegotiation;
use super::notifications::{
    Addressee, Audience, FanOutEvent, FanOutReport, Notification, NotificationCenter,
    NotificationPolicy, NotificationTransport, ReadReceipt, Recipient, ThreadMessage,
};
use super::rating::{RatingBook, Reputation};
use super::repository::{CommitBatch, RepairStore, RepositoryError, TicketWrite};
use super::status::{allowed_next, Operation, StatusCatalog, TicketStatus};
use crate::config::RepairConfig;

/// External collaborators the lifecycle consults.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityResolver>,
    pub units: Arc<dyn UnitDirectory>,
    pub companies: Arc<dyn CompanyDirectory>,
    pub billing: Arc<dyn SubscriptionGate>,
    pub transport: Arc<dyn NotificationTransport>,
}

impl Collaborators {
    /// Use one directory for identity, units, companies and billing.
    pub fn from_directory<D>(directory: Arc<D>, transport: Arc<dyn NotificationTransport>) -> Self
    where
        D: IdentityResolver + UnitDirectory + CompanyDirectory + SubscriptionGate + 'static,
    {
        Self {
            identity: directory.clone(),
            units: directory.clone(),
            companies: directory.clone(),
            billing: directory,
            transport,
        }
    }
}

/// Result of a committed lifecycle operation.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub ticket: Ticket,
    pub audit_entry: AuditEntryId,
    pub offer: Option<Offer>,
    pub request: Option<OfferRequest>,
    /// Tickets created by a split.
    pub children: Vec<Ticket>,
    /// Deliveries that did not go through. The transition itself is committed.
    pub warnings: Vec<TransportFailure>,
}

/// What an operation wants to commit, computed from the ticket as the guard saw it.
struct Plan {
    ticket: Ticket,
    event: EventKind,
    comment: Option<String>,
    payload: AuditPayload,
    change: CommitBatch,
    target: Option<CompanyKey>,
    offer: Option<Offer>,
    request: Option<OfferRequest>,
    children: Vec<Ticket>,
}

impl Plan {
    fn new(ticket: Ticket, event: EventKind) -> Self {
        Self {
            ticket,
            event,
            comment: None,
            payload: AuditPayload::default(),
            change: CommitBatch::default(),
            target: None,
            offer: None,
            request: None,
            children: Vec::new(),
        }
    }

    fn status(mut self, status: TicketStatus) -> Self {
        self.ticket.status = status;
        self
    }

    fn comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        self
    }
}

pub struct RepairService<S> {
    store: Arc<S>,
    negotiation: OfferNegotiation<S>,
    notifications: NotificationCenter<S>,
    audit: AuditLog<S>,
    ratings: RatingBook<S>,
    collaborators: Collaborators,
    catalog: StatusCatalog,
    config: RepairConfig,
    locks: Mutex<HashMap<TicketId, Arc<TicketLock<()>>>>,
}

impl<S> RepairService<S>
where
    S: RepairStore + 'static,
{
    pub fn new(store: Arc<S>, collaborators: Collaborators, config: RepairConfig) -> Self {
        let notifications = NotificationCenter::new(
            store.clone(),
            collaborators.transport.clone(),
            config.transport_timeout,
        );
        Self {
            negotiation: OfferNegotiation::new(store.clone()),
            audit: AuditLog::new(store.clone()),
            ratings: RatingBook::new(store.clone(), config.rating_scale),
            catalog: StatusCatalog::from_config(&config),
            notifications,
            store,
            collaborators,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &StatusCatalog {
        &self.catalog
    }

    pub fn negotiation(&self) -> &OfferNegotiation<S> {
        &self.negotiation
    }

    pub fn notifications(&self) -> &NotificationCenter<S> {
        &self.notifications
    }

    pub fn audit_log(&self) -> &AuditLog<S> {
        &self.audit
    }

    pub async fn create(
        &self,
        reporter: &Actor,
        details: TicketDetails,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::Create;
        let context = TicketContext {
            ticket: None,
            unit: details.unit.clone(),
            owner: Some(reporter.user.clone()),
            assignee: None,
        };
        self.authorize(reporter, operation, Action::CreateTicket, None, &context)?;

        if !self.collaborators.billing.is_active(&details.unit) {
            return Err(RepairError::validation(
                None,
                operation,
                format!("no active subscription covers unit {}", details.unit.0),
            ));
        }
        if details.title.trim().is_empty() {
            return Err(RepairError::validation(
                None,
                operation,
                "a damage report needs a title",
            ));
        }

        let ticket = Ticket::open(details, reporter, None);
        let mut plan = Plan::new(ticket.clone(), EventKind::Created);
        plan.payload = plan.payload.with_documents(ticket.documents.clone());
        let entry = self.audit_entry(&plan, reporter);
        let batch = CommitBatch {
            tickets: vec![TicketWrite {
                ticket: ticket.clone(),
                expected_version: None,
            }],
            audit: vec![entry.clone()],
            ..CommitBatch::default()
        };
        self.store
            .commit(batch)
            .map_err(|err| RepairError::from_repository(Some(&ticket.id), operation, err))?;

        info!(
            ticket = %ticket.id,
            operation = %operation,
            status = %ticket.status,
            event = EventKind::Created.key(),
            "damage report created"
        );
        Ok(self.finish(plan, entry, reporter, operation).await)
    }

    pub async fn assign_company(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        company: &CompanyId,
        kind: AssignmentKind,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::AssignCompany;
        self.transition(ticket, actor, operation, Action::AssignCompany, |current| {
            if !self.collaborators.companies.exists(company) {
                return Err(RepairError::not_found(
                    Some(&current.id),
                    operation,
                    "company",
                    company,
                ));
            }
            let children = self
                .store
                .children(&current.id)
                .map_err(|err| RepairError::from_repository(Some(&current.id), operation, err))?;
            if children.iter().any(|child| !child.deleted) {
                return Err(invalid_transition(current, operation));
            }

            let mut plan = Plan::new(current.clone(), EventKind::Assigned)
                .status(TicketStatus::AllocationPending);
            match kind {
                AssignmentKind::Assigned => {
                    plan.ticket.assignee = Some(company.clone());
                    plan.ticket.allocated = true;
                }
                AssignmentKind::Preferred => plan.ticket.preferred_company = Some(company.clone()),
            }
            let key = CompanyKey::Registered(company.clone());
            plan.payload = plan
                .payload
                .with_company(key.clone())
                .with_detail("assignment", assignment_label(kind));
            plan.target = Some(key);
            Ok(plan)
        })
        .await
    }

    /// Solicit a bid. Re-soliciting a company with an open request re-issues that request.
    pub async fn request_offer(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        target: OfferTarget,
        comment: Option<String>,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::RequestOffer;
        self.transition(ticket, actor, operation, Action::RequestOffer, |current| {
            let contact_email = match &target {
                OfferTarget::Registered(company) => {
                    if !self.collaborators.companies.exists(company) {
                        return Err(RepairError::not_found(
                            Some(&current.id),
                            operation,
                            "company",
                            company,
                        ));
                    }
                    self.collaborators.companies.contact_email(company)
                }
                OfferTarget::Unregistered { .. } => None,
            };
            let solicitation = self.negotiation.plan_solicit(
                &current.id,
                &target,
                contact_email,
                comment.clone(),
                operation,
            )?;

            let mut plan = Plan::new(current.clone(), EventKind::OfferRequested)
                .status(TicketStatus::OfferRequested)
                .comment(comment.clone());
            plan.payload = plan
                .payload
                .with_request(solicitation.request.id.clone())
                .with_company(target.key())
                .with_detail("reissued", solicitation.reissued.to_string());
            plan.target = Some(target.key());
            plan.change.merge(solicitation.change.into_batch());
            plan.request = Some(solicitation.request);
            Ok(plan)
        })
        .await
    }

    /// The solicited company declines to bid. The ticket keeps its status.
    pub async fn decline_offer_request(
        &self,
        actor: &Actor,
        request: &OfferRequestId,
        reason: &str,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::DeclineRequest;
        let solicited = self
            .store
            .offer_request(request)
            .map_err(|err| RepairError::from_repository(None, operation, err))?
            .ok_or_else(|| RepairError::not_found(None, operation, "offer request", request))?;
        let company = self.company_of(actor, Some(&solicited.ticket), operation)?;
        if solicited.company.as_ref() != Some(&company) {
            return Err(unauthorized(actor, Some(&solicited.ticket), operation));
        }

        self.transition(&solicited.ticket, actor, operation, Action::DeclineRequest, |current| {
            let (declined, change) =
                self.negotiation
                    .plan_reject_request(request, reason, operation)?;
            let mut plan = Plan::new(current.clone(), EventKind::OfferRequestDeclined)
                .comment(Some(reason.to_string()));
            plan.payload = plan
                .payload
                .with_request(declined.id.clone())
                .with_company(declined.company_key());
            plan.change.merge(change.into_batch());
            plan.request = Some(declined);
            Ok(plan)
        })
        .await
    }

    pub async fn submit_offer(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        bid: Bid,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::SubmitOffer;
        let company = self.company_of(actor, Some(ticket), operation)?;
        self.transition(ticket, actor, operation, Action::SubmitOffer, |current| {
            let placement = self.negotiation.plan_submit_bid(
                &current.id,
                &company,
                bid.clone(),
                self.config.allow_direct_offers,
                operation,
            )?;

            let mut plan = Plan::new(current.clone(), EventKind::OfferSubmitted)
                .status(TicketStatus::OfferReceived);
            plan.payload = plan
                .payload
                .with_offer(placement.offer.id.clone())
                .with_company(CompanyKey::Registered(company.clone()))
                .with_documents(placement.offer.documents.clone())
                .with_detail("total", placement.offer.total.to_string());
            if let Some(request) = &placement.offer.request {
                plan.payload = plan.payload.with_request(request.clone());
            }
            plan.target = Some(CompanyKey::Registered(company.clone()));
            plan.change.merge(placement.change.into_batch());
            plan.offer = Some(placement.offer);
            Ok(plan)
        })
        .await
    }

    /// Make `offer` the ticket's binding offer. A previously active offer is deactivated in
    /// the same commit, and the offer's company becomes the assignee.
    pub async fn accept_offer(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        offer: &OfferId,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::AcceptOffer;
        self.transition(ticket, actor, operation, Action::AcceptOffer, |current| {
            let candidate = self
                .store
                .offer(offer)
                .map_err(|err| RepairError::from_repository(Some(&current.id), operation, err))?
                .ok_or_else(|| RepairError::not_found(Some(&current.id), operation, "offer", offer))?;
            if candidate.ticket != current.id {
                return Err(RepairError::validation(
                    Some(&current.id),
                    operation,
                    format!("offer {offer} belongs to ticket {}", candidate.ticket),
                ));
            }
            let activation = self.negotiation.plan_activate(offer, operation)?;

            let mut plan = Plan::new(current.clone(), EventKind::OfferAccepted)
                .status(TicketStatus::OfferAccepted);
            plan.ticket.assignee = Some(activation.offer.company.clone());
            plan.ticket.allocated = true;
            let key = CompanyKey::Registered(activation.offer.company.clone());
            plan.payload = plan
                .payload
                .with_offer(activation.offer.id.clone())
                .with_company(key.clone());
            if !activation.deactivated.is_empty() {
                let replaced: Vec<String> =
                    activation.deactivated.iter().map(ToString::to_string).collect();
                plan.payload = plan.payload.with_detail("deactivated", replaced.join(","));
            }
            plan.target = Some(key);
            plan.change.merge(activation.change.into_batch());
            plan.offer = Some(activation.offer);
            Ok(plan)
        })
        .await
    }

    pub async fn schedule_repair(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        date: NaiveDate,
        comment: Option<String>,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::ScheduleRepair;
        self.transition(ticket, actor, operation, Action::ScheduleRepair, |current| {
            self.ensure_assignee(actor, current, operation)?;
            let mut plan = Plan::new(current.clone(), EventKind::RepairScheduled)
                .status(TicketStatus::RepairScheduled)
                .comment(comment.clone());
            plan.ticket.repair_date = Some(date);
            plan.payload = plan.payload.with_detail("repair_date", date.to_string());
            Ok(plan)
        })
        .await
    }

    /// Record the repair as done. A signature-required ticket repaired without a signature
    /// stays pending until [`Self::confirm_signature`].
    pub async fn mark_repaired(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        signature: Option<DocumentRef>,
        comment: Option<String>,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::MarkRepaired;
        self.transition(ticket, actor, operation, Action::MarkRepaired, |current| {
            self.ensure_assignee(actor, current, operation)?;
            let mut plan = Plan::new(current.clone(), EventKind::Repaired)
                .status(TicketStatus::RepairConfirmed)
                .comment(comment.clone());
            match &signature {
                Some(document) => {
                    plan.ticket.attach(document.clone());
                    plan.ticket.signature_pending = false;
                    plan.payload = plan.payload.with_documents(vec![document.clone()]);
                }
                None => plan.ticket.signature_pending = current.signature_required,
            }
            plan.payload = plan
                .payload
                .with_detail("signature_pending", plan.ticket.signature_pending.to_string());
            Ok(plan)
        })
        .await
    }

    pub async fn confirm_signature(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        document: DocumentRef,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::ConfirmSignature;
        self.transition(ticket, actor, operation, Action::ConfirmSignature, |current| {
            if !current.signature_pending {
                return Err(RepairError::validation(
                    Some(&current.id),
                    operation,
                    "no signature is pending on this ticket",
                ));
            }
            let mut plan = Plan::new(current.clone(), EventKind::SignatureConfirmed);
            plan.ticket.attach(document.clone());
            plan.ticket.signature_pending = false;
            plan.payload = plan.payload.with_documents(vec![document.clone()]);
            Ok(plan)
        })
        .await
    }

    pub async fn close(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        comment: Option<String>,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::Close;
        self.transition(ticket, actor, operation, Action::CloseTicket, |current| {
            if current.signature_pending {
                return Err(RepairError::validation(
                    Some(&current.id),
                    operation,
                    "the repair still awaits the reporter's signature",
                ));
            }
            Ok(Plan::new(current.clone(), EventKind::Closed)
                .status(TicketStatus::Closed)
                .comment(comment.clone()))
        })
        .await
    }

    pub async fn reject(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        reason: &str,
    ) -> Result<TransitionOutcome, RepairError> {
        self.terminate(actor, ticket, reason, Operation::Reject).await
    }

    pub async fn cancel(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        reason: &str,
    ) -> Result<TransitionOutcome, RepairError> {
        self.terminate(actor, ticket, reason, Operation::Cancel).await
    }

    async fn terminate(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        reason: &str,
        operation: Operation,
    ) -> Result<TransitionOutcome, RepairError> {
        let (action, event, status) = match operation {
            Operation::Reject => (Action::RejectTicket, EventKind::Rejected, TicketStatus::Rejected),
            _ => (Action::CancelTicket, EventKind::Cancelled, TicketStatus::Cancelled),
        };
        self.transition(ticket, actor, operation, action, |current| {
            if reason.trim().is_empty() {
                return Err(RepairError::validation(
                    Some(&current.id),
                    operation,
                    "a reason is required",
                ));
            }
            let mut plan = Plan::new(current.clone(), event)
                .status(status)
                .comment(Some(reason.to_string()));
            plan.change.merge(self.retire_open_requests(&current.id, operation)?);
            Ok(plan)
        })
        .await
    }

    /// Delegate the work to child tickets. The parent ends in `Delegated`.
    pub async fn split(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        children: Vec<TicketDetails>,
        comment: Option<String>,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::Split;
        self.transition(ticket, actor, operation, Action::SplitTicket, |current| {
            if children.is_empty() {
                return Err(RepairError::validation(
                    Some(&current.id),
                    operation,
                    "a split needs at least one child ticket",
                ));
            }
            let existing = self
                .store
                .children(&current.id)
                .map_err(|err| RepairError::from_repository(Some(&current.id), operation, err))?;
            if !existing.is_empty() {
                return Err(RepairError::validation(
                    Some(&current.id),
                    operation,
                    "ticket has already been split",
                ));
            }
            if let Some(blank) = children.iter().position(|spec| spec.title.trim().is_empty()) {
                return Err(RepairError::validation(
                    Some(&current.id),
                    operation,
                    format!("child ticket #{} needs a title", blank + 1),
                ));
            }

            let owner = Actor {
                user: current.owner.clone(),
                role: current.responsible_role,
            };
            let spawned: Vec<Ticket> = children
                .iter()
                .cloned()
                .map(|spec| Ticket::open(spec, &owner, Some(current.id.clone())))
                .collect();
            let child_ids: Vec<TicketId> = spawned.iter().map(|child| child.id.clone()).collect();

            let mut plan = Plan::new(current.clone(), EventKind::Split)
                .status(TicketStatus::Delegated)
                .comment(comment.clone());
            plan.payload = plan.payload.with_related(child_ids);
            plan.change.merge(self.retire_open_requests(&current.id, operation)?);
            for child in &spawned {
                plan.change.tickets.push(TicketWrite {
                    ticket: child.clone(),
                    expected_version: None,
                });
                let mut origin = Plan::new(child.clone(), EventKind::SplitFrom);
                origin.payload = origin.payload.with_related(vec![current.id.clone()]);
                plan.change.audit.push(self.audit_entry(&origin, actor));
            }
            plan.children = spawned;
            Ok(plan)
        })
        .await
    }

    /// Audit-only event; the status is unchanged.
    pub async fn comment(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        text: &str,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::Comment;
        self.transition(ticket, actor, operation, Action::Comment, |current| {
            if text.trim().is_empty() {
                return Err(RepairError::validation(
                    Some(&current.id),
                    operation,
                    "comment must not be empty",
                ));
            }
            Ok(Plan::new(current.clone(), EventKind::Commented).comment(Some(text.to_string())))
        })
        .await
    }

    /// Soft delete. The ticket resolves as not found afterwards; history stays.
    pub async fn delete(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        comment: Option<String>,
    ) -> Result<TransitionOutcome, RepairError> {
        let operation = Operation::Delete;
        self.transition(ticket, actor, operation, Action::DeleteTicket, |current| {
            let mut plan =
                Plan::new(current.clone(), EventKind::Deleted).comment(comment.clone());
            plan.ticket.deleted = true;
            Ok(plan)
        })
        .await
    }

    /// Rate the company that carried out a closed ticket.
    pub fn rate(
        &self,
        rater: &Actor,
        ticket: &TicketId,
        company: &CompanyId,
        score: u8,
    ) -> Result<CompanyRating, RepairError> {
        let operation = Operation::Rate;
        let current = self.live_ticket(ticket, operation)?;
        self.authorize(
            rater,
            operation,
            Action::RateCompany,
            Some(&current),
            &context_of(&current),
        )?;

        let mut participants: Vec<CompanyId> = current.assignee.iter().cloned().collect();
        if let Some(active) = self.negotiation.active_offer(&current.id)? {
            if !participants.contains(&active.company) {
                participants.push(active.company);
            }
        }

        let rating = self
            .ratings
            .rate(rater, &current, company, &participants, score)?;
        info!(
            ticket = %current.id,
            operation = %operation,
            company = %company,
            score,
            "company rated"
        );
        Ok(rating)
    }

    pub fn reputation(&self, company: &CompanyId) -> Result<Reputation, RepairError> {
        self.ratings.reputation(company)
    }

    /// A live (not deleted) ticket.
    pub fn ticket(&self, ticket: &TicketId) -> Result<Ticket, RepairError> {
        self.live_ticket(ticket, Operation::Comment)
    }

    pub fn children(&self, ticket: &TicketId) -> Result<Vec<Ticket>, RepairError> {
        let operation = Operation::Split;
        let parent = self.live_ticket(ticket, operation)?;
        let children = self
            .store
            .children(&parent.id)
            .map_err(|err| RepairError::from_repository(Some(&parent.id), operation, err))?;
        Ok(children.into_iter().filter(|child| !child.deleted).collect())
    }

    pub fn active_offer(&self, ticket: &TicketId) -> Result<Option<Offer>, RepairError> {
        let current = self.live_ticket(ticket, Operation::AcceptOffer)?;
        self.negotiation.active_offer(&current.id)
    }

    pub fn bids(&self, ticket: &TicketId) -> Result<Vec<Offer>, RepairError> {
        let current = self.live_ticket(ticket, Operation::SubmitOffer)?;
        self.negotiation.list_bids(&current.id)
    }

    pub fn offer_requests(&self, ticket: &TicketId) -> Result<Vec<OfferRequest>, RepairError> {
        let operation = Operation::RequestOffer;
        let current = self.live_ticket(ticket, operation)?;
        self.store
            .offer_requests(&current.id)
            .map_err(|err| RepairError::from_repository(Some(&current.id), operation, err))
    }

    /// Chronological history. Deleted tickets keep theirs.
    pub fn history(&self, ticket: &TicketId) -> Result<Vec<AuditEntry>, RepairError> {
        self.audit
            .history(ticket)
            .map_err(|err| RepairError::from_repository(Some(ticket), Operation::Comment, err))
    }

    pub fn history_by_actor(&self, user: &UserId) -> Result<Vec<AuditEntry>, RepairError> {
        self.audit
            .by_actor(user)
            .map_err(|err| RepairError::from_repository(None, Operation::Comment, err))
    }

    pub fn notifications_for(&self, user: &UserId) -> Result<Vec<Notification>, RepairError> {
        self.notifications.notifications_for(user)
    }

    pub fn unread_count(&self, user: &UserId, role: Role) -> Result<usize, RepairError> {
        self.notifications.unread_count(user, role)
    }

    pub fn mark_read(
        &self,
        notification: &NotificationId,
        user: &UserId,
    ) -> Result<Notification, RepairError> {
        self.notifications.mark_read(notification, user)
    }

    /// Post one message into the ticket thread, readable by every `(user, role)` listed.
    pub fn post_message(
        &self,
        actor: &Actor,
        ticket: &TicketId,
        body: &str,
        recipients: Vec<(UserId, Role)>,
    ) -> Result<(ThreadMessage, Vec<ReadReceipt>), RepairError> {
        let operation = Operation::PostMessage;
        let current = self.live_ticket(ticket, operation)?;
        self.authorize(
            actor,
            operation,
            Action::Comment,
            Some(&current),
            &context_of(&current),
        )?;
        let posted = self
            .notifications
            .post_message(&current.id, actor, body, recipients)?;
        debug!(
            ticket = %current.id,
            message = %posted.0.id,
            receipts = posted.1.len(),
            "thread message posted"
        );
        Ok(posted)
    }

    pub fn mark_message_read(
        &self,
        message: &MessageId,
        user: &UserId,
        role: Role,
    ) -> Result<(), RepairError> {
        self.notifications.mark_message_read(message, user, role)
    }

    async fn transition<F>(
        &self,
        ticket: &TicketId,
        actor: &Actor,
        operation: Operation,
        action: Action,
        plan_with: F,
    ) -> Result<TransitionOutcome, RepairError>
    where
        F: Fn(&Ticket) -> Result<Plan, RepairError>,
    {
        let guard = self.lock_ticket(ticket).await;
        let committed = self.commit_transition(ticket, actor, operation, action, &plan_with);
        self.release_ticket(ticket, guard);
        let (plan, entry) = committed?;

        info!(
            ticket = %plan.ticket.id,
            operation = %operation,
            status = %plan.ticket.status,
            event = plan.event.key(),
            version = plan.ticket.version,
            "ticket transition committed"
        );
        Ok(self.finish(plan, entry, actor, operation).await)
    }

    /// Guard, plan and commit under the ticket lock, re-planning on version conflicts.
    fn commit_transition<F>(
        &self,
        ticket: &TicketId,
        actor: &Actor,
        operation: Operation,
        action: Action,
        plan_with: &F,
    ) -> Result<(Plan, AuditEntry), RepairError>
    where
        F: Fn(&Ticket) -> Result<Plan, RepairError>,
    {
        let mut attempt = 0;
        loop {
            let current = self.live_ticket(ticket, operation)?;
            self.authorize(
                actor,
                operation,
                action,
                Some(&current),
                &context_of(&current),
            )?;
            if !operation.permits(current.status) {
                return Err(invalid_transition(&current, operation));
            }

            let mut plan = plan_with(&current)?;
            if plan.ticket.status != current.status
                && self.catalog.comment_required(plan.ticket.status)
                && plan.comment.is_none()
            {
                return Err(RepairError::validation(
                    Some(&current.id),
                    operation,
                    format!(
                        "moving to {} requires a comment",
                        plan.ticket.status.key()
                    ),
                ));
            }

            plan.ticket.version = current.version + 1;
            plan.ticket.updated_at = Utc::now();
            let entry = self.audit_entry(&plan, actor);

            let mut batch = CommitBatch {
                tickets: vec![TicketWrite {
                    ticket: plan.ticket.clone(),
                    expected_version: Some(current.version),
                }],
                audit: vec![entry.clone()],
                ..CommitBatch::default()
            };
            batch.merge(plan.change.clone());

            match self.store.commit(batch) {
                Ok(()) => return Ok((plan, entry)),
                Err(RepositoryError::VersionConflict {
                    expected, actual, ..
                }) if attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    warn!(
                        ticket = %ticket,
                        operation = %operation,
                        expected,
                        actual,
                        attempt,
                        "ticket changed concurrently, re-planning"
                    );
                }
                Err(err) => {
                    return Err(RepairError::from_repository(Some(ticket), operation, err));
                }
            }
        }
    }

    /// Fan a committed event out again from its audit entry. Rows that already exist are
    /// reused; only deliveries that never went through are retried.
    pub async fn refan_out(&self, entry: &AuditEntryId) -> Result<FanOutReport, RepairError> {
        let operation = Operation::Notify;
        let recorded = self
            .store
            .entry(entry)
            .map_err(|err| RepairError::from_repository(None, operation, err))?
            .ok_or_else(|| RepairError::not_found(None, operation, "audit entry", entry))?;
        let mut ticket = self
            .store
            .ticket(&recorded.ticket)
            .map_err(|err| RepairError::from_repository(Some(&recorded.ticket), operation, err))?
            .ok_or_else(|| {
                RepairError::not_found(Some(&recorded.ticket), operation, "ticket", &recorded.ticket)
            })?;
        ticket.status = recorded.status;

        let mut plan = Plan::new(ticket, recorded.event).comment(recorded.comment.clone());
        plan.target = recorded.payload.company.clone();
        plan.payload = recorded.payload.clone();
        let actor = Actor {
            user: recorded.actor.clone(),
            role: recorded.actor_role,
        };

        let report = self
            .fan_out_plan(&plan, &recorded.id, &actor, recorded.event.operation())
            .await;
        info!(
            ticket = %recorded.ticket,
            event = %recorded.id,
            created = report.created.len(),
            delivered = report.delivered,
            failed = report.failures.len(),
            "event fanned out again"
        );
        Ok(report)
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<TicketId, Arc<TicketLock<()>>>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn lock_ticket(&self, ticket: &TicketId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.lock_table().entry(ticket.clone()).or_default());
        lock.lock_owned().await
    }

    /// Unlock and drop the table entry unless another caller is holding or waiting on it.
    fn release_ticket(&self, ticket: &TicketId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.lock_table();
        let idle = locks
            .get(ticket)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if idle {
            locks.remove(ticket);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.lock_table().len()
    }

    fn live_ticket(&self, ticket: &TicketId, operation: Operation) -> Result<Ticket, RepairError> {
        self.store
            .ticket(ticket)
            .map_err(|err| RepairError::from_repository(Some(ticket), operation, err))?
            .filter(|found| !found.deleted)
            .ok_or_else(|| RepairError::not_found(Some(ticket), operation, "ticket", ticket))
    }

    fn authorize(
        &self,
        actor: &Actor,
        operation: Operation,
        action: Action,
        ticket: Option<&Ticket>,
        context: &TicketContext,
    ) -> Result<(), RepairError> {
        let identity = &self.collaborators.identity;
        let related = identity.role_of(&actor.user, context).is_some();
        if related && identity.has_permission(&actor.user, actor.role, action) {
            return Ok(());
        }
        debug!(
            user = %actor.user,
            role = actor.role.label(),
            operation = %operation,
            related,
            "permission denied"
        );
        Err(unauthorized(actor, ticket.map(|t| &t.id), operation))
    }

    fn company_of(
        &self,
        actor: &Actor,
        ticket: Option<&TicketId>,
        operation: Operation,
    ) -> Result<CompanyId, RepairError> {
        if actor.role != Role::Company {
            return Err(unauthorized(actor, ticket, operation));
        }
        self.collaborators
            .companies
            .company_of(&actor.user)
            .ok_or_else(|| unauthorized(actor, ticket, operation))
    }

    /// Company users may only report progress on tickets their company holds.
    fn ensure_assignee(
        &self,
        actor: &Actor,
        ticket: &Ticket,
        operation: Operation,
    ) -> Result<(), RepairError> {
        if actor.role != Role::Company {
            return Ok(());
        }
        let company = self.company_of(actor, Some(&ticket.id), operation)?;
        if ticket.assignee.as_ref() == Some(&company) {
            Ok(())
        } else {
            Err(unauthorized(actor, Some(&ticket.id), operation))
        }
    }

    fn retire_open_requests(
        &self,
        ticket: &TicketId,
        operation: Operation,
    ) -> Result<CommitBatch, RepairError> {
        let requests = self
            .negotiation
            .open_requests(ticket)?
            .into_iter()
            .map(|mut request| {
                request.status = OfferRequestStatus::Superseded;
                request
            })
            .collect();
        debug!(ticket = %ticket, operation = %operation, "retiring open offer requests");
        Ok(CommitBatch {
            requests,
            ..CommitBatch::default()
        })
    }

    fn audit_entry(&self, plan: &Plan, actor: &Actor) -> AuditEntry {
        let mut payload = plan.payload.clone();
        payload.status_text = Some(self.catalog.definition(plan.ticket.status).label.clone());
        if let Ok(responsibles) = self.collaborators.units.responsibles(&plan.ticket.unit) {
            payload.responsible_users = responsibles
                .with_roles()
                .into_iter()
                .map(|(user, _)| user)
                .collect();
        }
        AuditEntry::new(
            &plan.ticket.id,
            plan.ticket.status,
            plan.event,
            actor,
            plan.comment.clone(),
            payload,
        )
    }

    async fn finish(
        &self,
        plan: Plan,
        entry: AuditEntry,
        actor: &Actor,
        operation: Operation,
    ) -> TransitionOutcome {
        let report = self.fan_out_plan(&plan, &entry.id, actor, operation).await;
        TransitionOutcome {
            ticket: plan.ticket,
            audit_entry: entry.id,
            offer: plan.offer,
            request: plan.request,
            children: plan.children,
            warnings: report.failures,
        }
    }

    /// Recipient-resolution problems come first in `failures`, delivery failures after.
    async fn fan_out_plan(
        &self,
        plan: &Plan,
        entry: &AuditEntryId,
        actor: &Actor,
        operation: Operation,
    ) -> FanOutReport {
        let (addressees, warnings) = self.addressees(plan, actor, operation);
        if addressees.is_empty() {
            return FanOutReport {
                failures: warnings,
                ..FanOutReport::default()
            };
        }

        let label = &self.catalog.definition(plan.ticket.status).label;
        let event = FanOutEvent {
            id: entry.clone(),
            kind: plan.event,
            operation,
            ticket: Some(plan.ticket.id.clone()),
            text: NotificationPolicy::text(plan.event, &plan.ticket.title, label),
            payload: json!({
                "ticket": plan.ticket.id,
                "title": plan.ticket.title,
                "status": plan.ticket.status.key(),
                "event": plan.event.key(),
                "actor": actor.user,
                "comment": plan.comment,
            }),
        };
        let mut report = self.notifications.fan_out(&event, addressees).await;
        let delivery_failures = std::mem::replace(&mut report.failures, warnings);
        report.failures.extend(delivery_failures);
        report
    }

    /// Resolve the event's audiences to concrete recipients, minus the actor and anyone the
    /// identity collaborator does not let see the ticket.
    fn addressees(
        &self,
        plan: &Plan,
        actor: &Actor,
        operation: Operation,
    ) -> (Vec<Addressee>, Vec<TransportFailure>) {
        let ticket = &plan.ticket;
        let mut recipients: Vec<Recipient> = Vec::new();
        let mut warnings = Vec::new();
        let mut warn_about = |recipient: &str, reason: String| {
            warn!(
                ticket = %ticket.id,
                operation = %operation,
                event = plan.event.key(),
                %reason,
                "recipient resolution failed"
            );
            warnings.push(TransportFailure {
                ticket: Some(ticket.id.clone()),
                operation,
                recipient: recipient.to_string(),
                reason,
            });
        };

        for audience in NotificationPolicy::audiences(plan.event) {
            match audience {
                Audience::UnitResponsibles => {
                    match self.collaborators.units.responsibles(&ticket.unit) {
                        Ok(responsibles) => recipients.extend(
                            responsibles
                                .with_roles()
                                .into_iter()
                                .map(|(user, role)| Recipient::User { user, role }),
                        ),
                        Err(err) => warn_about("unit responsibles", err.to_string()),
                    }
                }
                Audience::TicketOwner => {
                    recipients.push(Recipient::user(&ticket.owner, ticket.responsible_role));
                }
                Audience::Assignee => {
                    if let Some(company) = &ticket.assignee {
                        recipients.extend(self.company_recipients(company));
                    }
                }
                Audience::TargetCompany => match &plan.target {
                    Some(CompanyKey::Registered(company)) => {
                        recipients.extend(self.company_recipients(company));
                    }
                    Some(CompanyKey::Email(address)) => recipients.push(Recipient::email(address)),
                    None => {}
                },
                Audience::Participants => {
                    match self.participants(ticket) {
                        Ok(found) => recipients.extend(found),
                        Err(err) => warn_about("participants", err.to_string()),
                    }
                }
            }
        }

        let identity = &self.collaborators.identity;
        let mut addressees: Vec<Addressee> = Vec::new();
        for recipient in recipients {
            let locale = match &recipient {
                Recipient::User { user, role } => {
                    if user == &actor.user || !identity.has_permission(user, *role, Action::ViewTicket) {
                        continue;
                    }
                    identity.locale_of(user)
                }
                Recipient::Email { .. } => Locale::De,
            };
            if addressees.iter().all(|known| known.recipient != recipient) {
                addressees.push(Addressee { recipient, locale });
            }
        }
        (addressees, warnings)
    }

    fn company_recipients(&self, company: &CompanyId) -> Vec<Recipient> {
        let members = self.collaborators.companies.members(company);
        if members.is_empty() {
            return self
                .collaborators
                .companies
                .contact_email(company)
                .map(Recipient::email)
                .into_iter()
                .collect();
        }
        members
            .iter()
            .map(|member| Recipient::user(member, Role::Company))
            .collect()
    }

    /// Everyone the ticket has involved: owner, responsibles, companies, and past actors.
    fn participants(&self, ticket: &Ticket) -> Result<Vec<Recipient>, RepositoryError> {
        let mut recipients = vec![Recipient::user(&ticket.owner, ticket.responsible_role)];
        if let Ok(responsibles) = self.collaborators.units.responsibles(&ticket.unit) {
            recipients.extend(
                responsibles
                    .with_roles()
                    .into_iter()
                    .map(|(user, role)| Recipient::User { user, role }),
            );
        }
        for company in ticket.assignee.iter().chain(ticket.preferred_company.iter()) {
            recipients.extend(self.company_recipients(company));
        }
        for request in self.store.offer_requests(&ticket.id)? {
            match (&request.company, &request.contact_email) {
                (Some(company), _) => recipients.extend(self.company_recipients(company)),
                (None, Some(email)) => recipients.push(Recipient::email(email.as_str())),
                (None, None) => {}
            }
        }
        for entry in self.store.for_ticket(&ticket.id)? {
            recipients.push(Recipient::user(&entry.actor, entry.actor_role));
        }
        Ok(recipients)
    }
}

fn context_of(ticket: &Ticket) -> TicketContext {
    TicketContext {
        ticket: Some(ticket.id.clone()),
        unit: ticket.unit.clone(),
        owner: Some(ticket.owner.clone()),
        assignee: ticket.assignee.clone(),
    }
}

fn invalid_transition(ticket: &Ticket, operation: Operation) -> RepairError {
    RepairError::InvalidTransition {
        ticket: ticket.id.clone(),
        operation,
        current: ticket.status,
        allowed: allowed_next(ticket.status),
    }
}

fn unauthorized(actor: &Actor, ticket: Option<&TicketId>, operation: Operation) -> RepairError {
    RepairError::Unauthorized {
        ticket: ticket.cloned(),
        operation,
        user: actor.user.clone(),
        role: actor.role,
    }
}

fn assignment_label(kind: AssignmentKind) -> &'static str {
    match kind {
        AssignmentKind::Preferred => "preferred",
        AssignmentKind::Assigned => "assigned",
    }
}
