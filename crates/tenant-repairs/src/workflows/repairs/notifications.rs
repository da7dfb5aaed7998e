//! Per-recipient notification rows, shared thread messages with read receipts, and
//! delivery through the outbound mail/push transport.
//!
//! Rows are keyed by `(event, recipient)`: fanning the same event out twice creates nothing
//! new and only retries deliveries that never went through. Deliveries run concurrently,
//! each bounded by the configured timeout; failures come back as [`TransportFailure`]
//! warnings and never as errors.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::audit::EventKind;
use super::domain::{
    Actor, AuditEntryId, LocalizedText, Locale, MessageId, NotificationId, Role, TicketId,
    UserId,
};
use super::error::{RepairError, TransportFailure};
use super::repository::{NotificationStore, RepositoryError};
use super::status::Operation;

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Recipient {
    /// Platform user, with the role the notification was addressed to.
    User { user: UserId, role: Role },
    /// Unregistered company reached only by e-mail.
    Email { address: String },
}

impl Recipient {
    pub fn user(user: &UserId, role: Role) -> Self {
        Self::User {
            user: user.clone(),
            role,
        }
    }

    pub fn email(address: impl Into<String>) -> Self {
        Self::Email {
            address: address.into().trim().to_ascii_lowercase(),
        }
    }

    pub fn is_user(&self, candidate: &UserId) -> bool {
        matches!(self, Self::User { user, .. } if user == candidate)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User { user, role } => write!(f, "{user} ({})", role.label()),
            Self::Email { address } => write!(f, "<{address}>"),
        }
    }
}

/// One recipient's copy of an event notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    /// Originating audit entry.
    pub event: AuditEntryId,
    pub event_kind: EventKind,
    pub ticket: Option<TicketId>,
    pub recipient: Recipient,
    pub text: LocalizedText,
    pub read: bool,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

/// Message posted once into a ticket thread and shared by all its recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: MessageId,
    pub ticket: TicketId,
    pub author: UserId,
    pub author_role: Role,
    pub body: String,
    pub posted_at: DateTime<Utc>,
}

/// Read flag of one `(message, user, role)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub message: MessageId,
    pub user: UserId,
    pub role: Role,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

/// Groups of people an event can be addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    /// Owners, administrators and janitors of the unit.
    UnitResponsibles,
    /// The ticket's creator.
    TicketOwner,
    /// Members of the assigned company.
    Assignee,
    /// The company the event is about (solicited, bidding, accepted).
    TargetCompany,
    /// Everyone who has been involved with the ticket so far.
    Participants,
}

/// Event kind → audiences table.
pub struct NotificationPolicy;

impl NotificationPolicy {
    pub fn audiences(event: EventKind) -> &'static [Audience] {
        use Audience::*;
        match event {
            EventKind::Created | EventKind::Split => &[UnitResponsibles],
            EventKind::Assigned => &[TargetCompany, TicketOwner],
            EventKind::OfferRequested => &[TargetCompany],
            EventKind::OfferRequestDeclined | EventKind::OfferSubmitted => {
                &[TicketOwner, UnitResponsibles]
            }
            EventKind::OfferAccepted => &[TargetCompany, TicketOwner],
            EventKind::RepairScheduled | EventKind::SignatureConfirmed => {
                &[TicketOwner, Assignee]
            }
            EventKind::Repaired => &[TicketOwner, UnitResponsibles],
            EventKind::Closed => &[TicketOwner, Assignee, UnitResponsibles],
            EventKind::Rejected | EventKind::Cancelled | EventKind::Commented => &[Participants],
            EventKind::SplitFrom => &[],
            EventKind::Deleted => &[TicketOwner],
        }
    }

    /// Two-language notification text for an event on a ticket.
    pub fn text(event: EventKind, title: &str, status: &LocalizedText) -> LocalizedText {
        let (de, en) = match event {
            EventKind::Created => ("Neue Schadensmeldung", "New damage report"),
            EventKind::Assigned => ("Handwerker zugewiesen", "Company assigned"),
            EventKind::OfferRequested => ("Offerte angefragt", "Offer requested"),
            EventKind::OfferRequestDeclined => ("Offertanfrage abgelehnt", "Offer request declined"),
            EventKind::OfferSubmitted => ("Neue Offerte eingegangen", "New offer received"),
            EventKind::OfferAccepted => ("Offerte angenommen", "Offer accepted"),
            EventKind::RepairScheduled => ("Reparatur terminiert", "Repair scheduled"),
            EventKind::Repaired => ("Reparatur ausgeführt", "Repair carried out"),
            EventKind::SignatureConfirmed => ("Unterschrift bestätigt", "Signature confirmed"),
            EventKind::Closed => ("Schadensmeldung abgeschlossen", "Damage report closed"),
            EventKind::Rejected => ("Schadensmeldung abgelehnt", "Damage report rejected"),
            EventKind::Cancelled => ("Schadensmeldung storniert", "Damage report cancelled"),
            EventKind::Split => ("Schadensmeldung aufgeteilt", "Damage report split"),
            EventKind::SplitFrom => ("Teilauftrag erstellt", "Sub-ticket created"),
            EventKind::Commented => ("Neuer Kommentar", "New comment"),
            EventKind::Deleted => ("Schadensmeldung gelöscht", "Damage report deleted"),
        };
        LocalizedText::new(
            format!("{de}: {title} ({})", status.de),
            format!("{en}: {title} ({})", status.en),
        )
    }
}

/// What fan-out hands to the transport for one recipient.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub notification: NotificationId,
    pub recipient: Recipient,
    pub locale: Locale,
    /// Template key, the event kind's key.
    pub template: &'static str,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("recipient {0} was refused by the transport")]
    Refused(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Outbound mail/push channel.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, delivery: Delivery) -> Result<DeliveryReceipt, TransportError>;
}

/// Transport that only logs; used when no mail/push backend is wired in.
#[derive(Debug, Clone, Default)]
pub struct TracingTransport;

#[async_trait]
impl NotificationTransport for TracingTransport {
    async fn send(&self, delivery: Delivery) -> Result<DeliveryReceipt, TransportError> {
        info!(
            notification = %delivery.notification,
            recipient = %delivery.recipient,
            template = delivery.template,
            "notification dispatched"
        );
        Ok(DeliveryReceipt {
            accepted_at: Utc::now(),
        })
    }
}

/// Event being fanned out.
#[derive(Debug, Clone)]
pub struct FanOutEvent {
    pub id: AuditEntryId,
    pub kind: EventKind,
    pub operation: Operation,
    pub ticket: Option<TicketId>,
    pub text: LocalizedText,
    pub payload: serde_json::Value,
}

/// A recipient plus the language to address them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressee {
    pub recipient: Recipient,
    pub locale: Locale,
}

#[derive(Debug, Clone, Default)]
pub struct FanOutReport {
    pub created: Vec<NotificationId>,
    /// Recipients that already had a row for this event.
    pub duplicates: usize,
    pub delivered: usize,
    pub failures: Vec<TransportFailure>,
}

pub struct NotificationCenter<S: ?Sized> {
    store: Arc<S>,
    transport: Arc<dyn NotificationTransport>,
    timeout: Duration,
}

impl<S: ?Sized> Clone for NotificationCenter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            timeout: self.timeout,
        }
    }
}

impl<S> NotificationCenter<S>
where
    S: NotificationStore + ?Sized,
{
    pub fn new(store: Arc<S>, transport: Arc<dyn NotificationTransport>, timeout: Duration) -> Self {
        Self {
            store,
            transport,
            timeout,
        }
    }

    /// Create one row per addressee and deliver the ones not delivered yet.
    pub async fn fan_out(&self, event: &FanOutEvent, addressees: Vec<Addressee>) -> FanOutReport {
        let mut report = FanOutReport::default();
        let mut pending = Vec::new();

        for addressee in dedup(addressees) {
            match self.stage(event, &addressee) {
                Ok(Staged::Created(notification)) => {
                    report.created.push(notification.id.clone());
                    pending.push((notification, addressee.locale));
                }
                Ok(Staged::Existing(notification)) => {
                    report.duplicates += 1;
                    if !notification.delivered {
                        pending.push((notification, addressee.locale));
                    }
                }
                Err(err) => {
                    warn!(
                        event = %event.id,
                        recipient = %addressee.recipient,
                        error = %err,
                        "notification row could not be stored"
                    );
                    report.failures.push(failure(
                        event,
                        &addressee.recipient,
                        format!("notification could not be stored: {err}"),
                    ));
                }
            }
        }

        let mut deliveries = JoinSet::new();
        for (notification, locale) in pending {
            let transport = Arc::clone(&self.transport);
            let timeout = self.timeout;
            let delivery = Delivery {
                notification: notification.id.clone(),
                recipient: notification.recipient.clone(),
                locale,
                template: event.kind.key(),
                payload: event.payload.clone(),
            };
            deliveries.spawn(async move {
                let recipient = delivery.recipient.clone();
                let id = delivery.notification.clone();
                let outcome = match tokio::time::timeout(timeout, transport.send(delivery)).await {
                    Ok(Ok(_receipt)) => Ok(()),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(_) => Err(format!("delivery timed out after {timeout:?}")),
                };
                (id, recipient, outcome)
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((id, _, Ok(()))) => {
                    report.delivered += 1;
                    if let Err(err) = self.store.mark_delivered(&id) {
                        warn!(notification = %id, error = %err, "delivery flag not stored");
                    }
                }
                Ok((id, recipient, Err(reason))) => {
                    warn!(
                        event = %event.id,
                        notification = %id,
                        recipient = %recipient,
                        %reason,
                        "notification delivery failed"
                    );
                    report.failures.push(failure(event, &recipient, reason));
                }
                Err(err) => {
                    warn!(event = %event.id, error = %err, "delivery task aborted");
                    report.failures.push(TransportFailure {
                        ticket: event.ticket.clone(),
                        operation: event.operation,
                        recipient: "unknown".to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        debug!(
            event = %event.id,
            created = report.created.len(),
            duplicates = report.duplicates,
            delivered = report.delivered,
            failed = report.failures.len(),
            "fan-out finished"
        );
        report
    }

    fn stage(&self, event: &FanOutEvent, addressee: &Addressee) -> Result<Staged, RepositoryError> {
        if let Some(existing) = self.store.find_notification(&event.id, &addressee.recipient)? {
            return Ok(Staged::Existing(existing));
        }
        let notification = Notification {
            id: NotificationId::next(),
            event: event.id.clone(),
            event_kind: event.kind,
            ticket: event.ticket.clone(),
            recipient: addressee.recipient.clone(),
            text: event.text.clone(),
            read: false,
            delivered: false,
            created_at: Utc::now(),
        };
        if self.store.insert_notification(notification.clone())? {
            Ok(Staged::Created(notification))
        } else {
            // lost a race with a concurrent fan-out of the same event
            self.store
                .find_notification(&event.id, &addressee.recipient)?
                .map(Staged::Existing)
                .ok_or(RepositoryError::NotFound)
        }
    }

    /// Flag one recipient's copy as read. Other recipients' copies are untouched.
    pub fn mark_read(
        &self,
        notification: &NotificationId,
        user: &UserId,
    ) -> Result<Notification, RepairError> {
        let operation = Operation::MarkRead;
        let mut current = self
            .store
            .notification(notification)
            .map_err(|err| RepairError::from_repository(None, operation, err))?
            .filter(|row| row.recipient.is_user(user))
            .ok_or_else(|| RepairError::not_found(None, operation, "notification", notification))?;
        if !current.read {
            self.store
                .set_notification_read(notification, true)
                .map_err(|err| RepairError::from_repository(current.ticket.as_ref(), operation, err))?;
            current.read = true;
        }
        Ok(current)
    }

    pub fn notifications_for(&self, user: &UserId) -> Result<Vec<Notification>, RepairError> {
        let mut rows = self
            .store
            .notifications_for(user)
            .map_err(|err| RepairError::from_repository(None, Operation::MarkRead, err))?;
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    /// Unread notifications plus unread thread messages addressed to `(user, role)`.
    pub fn unread_count(&self, user: &UserId, role: Role) -> Result<usize, RepairError> {
        let operation = Operation::MarkRead;
        let notifications = self
            .store
            .notifications_for(user)
            .map_err(|err| RepairError::from_repository(None, operation, err))?
            .into_iter()
            .filter(|row| !row.read && row.recipient == Recipient::user(user, role))
            .count();
        let messages = self
            .store
            .unread_receipts(user, role)
            .map_err(|err| RepairError::from_repository(None, operation, err))?
            .len();
        Ok(notifications + messages)
    }

    /// Store one shared message with an unread receipt per `(user, role)`.
    pub fn post_message(
        &self,
        ticket: &TicketId,
        author: &Actor,
        body: &str,
        recipients: Vec<(UserId, Role)>,
    ) -> Result<(ThreadMessage, Vec<ReadReceipt>), RepairError> {
        let operation = Operation::PostMessage;
        if body.trim().is_empty() {
            return Err(RepairError::validation(
                Some(ticket),
                operation,
                "message body must not be empty",
            ));
        }

        let message = ThreadMessage {
            id: MessageId::next(),
            ticket: ticket.clone(),
            author: author.user.clone(),
            author_role: author.role,
            body: body.trim().to_string(),
            posted_at: Utc::now(),
        };

        let mut receipts: Vec<ReadReceipt> = Vec::new();
        for (user, role) in recipients {
            let own = user == author.user && role == author.role;
            if own || receipts.iter().any(|r| r.user == user && r.role == role) {
                continue;
            }
            receipts.push(ReadReceipt {
                message: message.id.clone(),
                user,
                role,
                read: false,
                read_at: None,
            });
        }

        self.store
            .insert_message(message.clone(), receipts.clone())
            .map_err(|err| RepairError::from_repository(Some(ticket), operation, err))?;
        Ok((message, receipts))
    }

    pub fn mark_message_read(
        &self,
        message: &MessageId,
        user: &UserId,
        role: Role,
    ) -> Result<(), RepairError> {
        let operation = Operation::MarkRead;
        match self.store.set_receipt_read(message, user, role) {
            Ok(()) => Ok(()),
            Err(RepositoryError::NotFound) => Err(RepairError::not_found(
                None,
                operation,
                "read receipt",
                format!("{message}/{user}/{}", role.label()),
            )),
            Err(err) => Err(RepairError::from_repository(None, operation, err)),
        }
    }

    pub fn receipts(&self, message: &MessageId) -> Result<Vec<ReadReceipt>, RepairError> {
        self.store
            .receipts(message)
            .map_err(|err| RepairError::from_repository(None, Operation::MarkRead, err))
    }
}

enum Staged {
    Created(Notification),
    Existing(Notification),
}

fn dedup(addressees: Vec<Addressee>) -> Vec<Addressee> {
    let mut unique: Vec<Addressee> = Vec::with_capacity(addressees.len());
    for addressee in addressees {
        if !unique.iter().any(|seen| seen.recipient == addressee.recipient) {
            unique.push(addressee);
        }
    }
    unique
}

fn failure(event: &FanOutEvent, recipient: &Recipient, reason: String) -> TransportFailure {
    TransportFailure {
        ticket: event.ticket.clone(),
        operation: event.operation,
        recipient: recipient.to_string(),
        reason,
    }
}
