use std::time::Duration;

use serde_json::json;

use super::common::*;
use crate::config::RepairConfig;
use crate::workflows::repairs::audit::EventKind;
use crate::workflows::repairs::directory::Action;
use crate::workflows::repairs::domain::{
    AssignmentKind, AuditEntryId, Locale, LocalizedText, OfferTarget, Role,
};
use crate::workflows::repairs::error::RepairError;
use crate::workflows::repairs::notifications::{Addressee, FanOutEvent, Recipient};
use crate::workflows::repairs::status::Operation;

fn addressee(user_id: &str, role: Role) -> Addressee {
    Addressee {
        recipient: Recipient::user(&user(user_id), role),
        locale: Locale::De,
    }
}

fn comment_event(id: AuditEntryId) -> FanOutEvent {
    FanOutEvent {
        id,
        kind: EventKind::Commented,
        operation: Operation::Comment,
        ticket: None,
        text: LocalizedText::new("Neuer Kommentar", "New comment"),
        payload: json!({ "comment": "checked the valve" }),
    }
}

#[tokio::test]
async fn fan_out_is_idempotent_per_event_and_recipient() {
    let h = harness();
    let event = comment_event(AuditEntryId::next());
    let addressees = vec![
        addressee("olivia", Role::Owner),
        addressee("adam", Role::Administrator),
        addressee("olivia", Role::Owner),
    ];

    let first = h
        .service
        .notifications()
        .fan_out(&event, addressees.clone())
        .await;
    assert_eq!(first.created.len(), 2);
    assert_eq!(first.duplicates, 0);
    assert_eq!(first.delivered, 2);
    assert!(first.failures.is_empty());

    let second = h.service.notifications().fan_out(&event, addressees).await;
    assert!(second.created.is_empty());
    assert_eq!(second.duplicates, 2);
    assert_eq!(second.delivered, 0);

    assert_eq!(h.store.notifications().expect("rows").len(), 2);
    assert_eq!(h.transport.deliveries().len(), 2);
}

#[tokio::test]
async fn read_state_is_tracked_per_recipient() {
    let h = harness();
    h.open_ticket("Leaking sink").await;

    let olivia_row = h
        .service
        .notifications_for(&user("olivia"))
        .expect("rows")
        .pop()
        .expect("olivia notified");
    let marked = h
        .service
        .mark_read(&olivia_row.id, &user("olivia"))
        .expect("marked read");
    assert!(marked.read);

    assert_eq!(h.service.unread_count(&user("olivia"), Role::Owner).expect("count"), 0);
    assert_eq!(
        h.service
            .unread_count(&user("adam"), Role::Administrator)
            .expect("count"),
        1
    );
    let adam_row = h
        .service
        .notifications_for(&user("adam"))
        .expect("rows")
        .pop()
        .expect("adam notified");
    assert_eq!(adam_row.event, olivia_row.event);
    assert!(!adam_row.read);

    h.service
        .mark_read(&olivia_row.id, &user("olivia"))
        .expect("marking twice is harmless");
}

#[tokio::test]
async fn only_the_recipient_can_mark_a_notification_read() {
    let h = harness();
    h.open_ticket("Leaking sink").await;
    let row = h
        .service
        .notifications_for(&user("olivia"))
        .expect("rows")
        .pop()
        .expect("olivia notified");

    match h.service.mark_read(&row.id, &user("rita")) {
        Err(RepairError::NotFound { entity, operation, .. }) => {
            assert_eq!(entity, "notification");
            assert_eq!(operation, Operation::MarkRead);
        }
        other => panic!("expected not found, got {other:?}"),
    }
    assert!(!h
        .service
        .notifications_for(&user("olivia"))
        .expect("rows")[0]
        .read);
}

#[tokio::test]
async fn refused_delivery_becomes_a_warning_and_can_be_retried() {
    let h = harness();
    let ticket = h.open_ticket("Leaking sink").await;
    h.transport.refuse("sam");

    let outcome = h
        .service
        .assign_company(&adam(), &ticket, &company(SANITAER), AssignmentKind::Assigned)
        .await
        .expect("transition commits despite delivery failure");
    assert_eq!(outcome.warnings.len(), 1);
    let warning = &outcome.warnings[0];
    assert!(warning.recipient.contains("sam"));
    assert_eq!(warning.operation, Operation::AssignCompany);
    assert_eq!(warning.ticket.as_ref(), Some(&ticket));
    assert_eq!(
        h.service.ticket(&ticket).expect("ticket").assignee,
        Some(company(SANITAER))
    );

    let sam_row = h
        .service
        .notifications_for(&user("sam"))
        .expect("rows")
        .pop()
        .expect("row stored even though delivery failed");
    assert!(!sam_row.delivered);

    h.transport.heal();
    let retry = FanOutEvent {
        id: outcome.audit_entry.clone(),
        kind: EventKind::Assigned,
        operation: Operation::AssignCompany,
        ticket: Some(ticket.clone()),
        text: sam_row.text.clone(),
        payload: json!({ "ticket": ticket }),
    };
    let report = h
        .service
        .notifications()
        .fan_out(
            &retry,
            vec![addressee("sam", Role::Company), addressee("rita", Role::Reporter)],
        )
        .await;
    assert!(report.created.is_empty());
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.delivered, 1, "only the undelivered row is resent");
    assert!(report.failures.is_empty());

    let rows = h.service.notifications_for(&user("sam")).expect("rows");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].delivered);
}

#[tokio::test]
async fn committed_event_is_fanned_out_again_from_its_audit_entry() {
    let h = harness();
    let ticket = h.open_ticket("Leaking sink").await;
    h.transport.refuse("sam");

    let outcome = h
        .service
        .assign_company(&adam(), &ticket, &company(SANITAER), AssignmentKind::Assigned)
        .await
        .expect("assigned");
    assert_eq!(outcome.warnings.len(), 1);
    let stored = h.store.notifications().expect("rows").len();

    h.transport.heal();
    let report = h
        .service
        .refan_out(&outcome.audit_entry)
        .await
        .expect("event fanned out again");
    assert!(report.created.is_empty());
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.delivered, 1);
    assert!(report.failures.is_empty());
    assert_eq!(h.store.notifications().expect("rows").len(), stored);

    let to_sam: Vec<_> = h
        .transport
        .deliveries()
        .into_iter()
        .filter(|delivery| delivery.recipient.is_user(&user("sam")))
        .collect();
    assert_eq!(to_sam.len(), 1);
    assert_eq!(to_sam[0].template, "assigned");
    assert_eq!(to_sam[0].payload["status"], "allocation_pending");

    let again = h
        .service
        .refan_out(&outcome.audit_entry)
        .await
        .expect("nothing left to retry");
    assert_eq!(again.delivered, 0);

    match h.service.refan_out(&AuditEntryId("evt-missing".to_string())).await {
        Err(RepairError::NotFound { entity, .. }) => assert_eq!(entity, "audit entry"),
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_transport_times_out_without_blocking_the_transition() {
    let h = harness_with(RepairConfig {
        transport_timeout: Duration::from_millis(50),
        ..RepairConfig::default()
    });
    h.transport.stall_for(Duration::from_secs(30));

    let outcome = h
        .service
        .create(&rita(), details("Leaking sink"))
        .await
        .expect("created");

    assert_eq!(outcome.warnings.len(), 3);
    assert!(outcome
        .warnings
        .iter()
        .all(|warning| warning.reason.contains("timed out")));
    assert!(h.service.ticket(&outcome.ticket.id).is_ok());
    assert!(h.transport.deliveries().is_empty());
}

#[tokio::test]
async fn users_who_cannot_view_tickets_are_not_notified() {
    let h = harness();
    h.directory.revoke(Role::Janitor, Action::ViewTicket);

    h.open_ticket("Leaking sink").await;

    assert!(h
        .service
        .notifications_for(&user("jana"))
        .expect("rows")
        .is_empty());
    assert_eq!(h.service.notifications_for(&user("olivia")).expect("rows").len(), 1);
}

#[tokio::test]
async fn unregistered_company_is_notified_by_email() {
    let h = harness();
    let ticket = h.open_ticket("Blocked drain").await;
    h.service
        .assign_company(&adam(), &ticket, &company(SANITAER), AssignmentKind::Preferred)
        .await
        .expect("preference recorded");
    h.service
        .request_offer(
            &adam(),
            &ticket,
            OfferTarget::Unregistered {
                email: "kontakt@rohrfrei.ch".to_string(),
            },
            None,
        )
        .await
        .expect("solicited");

    let expected = Recipient::email("kontakt@rohrfrei.ch");
    let delivered: Vec<_> = h
        .transport
        .deliveries()
        .into_iter()
        .filter(|delivery| delivery.recipient == expected)
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].template, EventKind::OfferRequested.key());
    assert_eq!(delivered[0].locale, Locale::De);
    assert_eq!(delivered[0].payload["status"], "offer_requested");
}

#[tokio::test]
async fn thread_messages_carry_one_receipt_per_user_and_role() {
    let h = harness();
    let ticket = h.open_ticket("Leaking sink").await;

    let (message, receipts) = h
        .service
        .post_message(
            &adam(),
            &ticket,
            "Plumber comes Tuesday morning",
            vec![
                (user("rita"), Role::Reporter),
                (user("olivia"), Role::Owner),
                (user("rita"), Role::Reporter),
                (user("adam"), Role::Administrator),
            ],
        )
        .expect("posted");
    assert_eq!(receipts.len(), 2);
    assert!(receipts.iter().all(|receipt| !receipt.read));

    assert_eq!(h.service.unread_count(&user("rita"), Role::Reporter).expect("count"), 1);
    h.service
        .mark_message_read(&message.id, &user("rita"), Role::Reporter)
        .expect("read");
    assert_eq!(h.service.unread_count(&user("rita"), Role::Reporter).expect("count"), 0);

    let stored = h.service.notifications().receipts(&message.id).expect("receipts");
    let olivia = stored
        .iter()
        .find(|receipt| receipt.user == user("olivia"))
        .expect("olivia receipt");
    assert!(!olivia.read);
    let rita = stored
        .iter()
        .find(|receipt| receipt.user == user("rita"))
        .expect("rita receipt");
    assert!(rita.read && rita.read_at.is_some());

    match h
        .service
        .mark_message_read(&message.id, &user("eli"), Role::Company)
    {
        Err(RepairError::NotFound { entity, .. }) => assert_eq!(entity, "read receipt"),
        other => panic!("expected not found, got {other:?}"),
    }
    assert!(matches!(
        h.service.post_message(&adam(), &ticket, "  ", Vec::new()),
        Err(RepairError::Validation { .. })
    ));
}
