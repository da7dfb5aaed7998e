use chrono::NaiveDate;

use super::common::*;
use crate::config::RepairConfig;
use crate::workflows::repairs::audit::{replay_status, status_trail, EventKind};
use crate::workflows::repairs::domain::{
    AssignmentKind, DocumentRef, OfferRequestStatus, Role, TicketId,
};
use crate::workflows::repairs::error::RepairError;
use crate::workflows::repairs::repository::RepairRepository;
use crate::workflows::repairs::status::{Operation, TicketStatus};

#[tokio::test]
async fn create_opens_ticket_and_notifies_unit_responsibles() {
    let h = harness();

    let outcome = h
        .service
        .create(&rita(), details("Leaking sink"))
        .await
        .expect("ticket created");

    assert_eq!(outcome.ticket.status, TicketStatus::Open);
    assert_eq!(outcome.ticket.owner, user("rita"));
    assert_eq!(outcome.ticket.responsible_role, Role::Reporter);
    assert!(outcome.warnings.is_empty());

    let history = h.service.history(&outcome.ticket.id).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event, EventKind::Created);
    assert_eq!(history[0].id, outcome.audit_entry);

    for responsible in ["olivia", "adam", "jana"] {
        let rows = h
            .service
            .notifications_for(&user(responsible))
            .expect("notifications");
        assert_eq!(rows.len(), 1, "{responsible} should be notified once");
        assert_eq!(rows[0].event_kind, EventKind::Created);
    }
    assert!(h
        .service
        .notifications_for(&user("rita"))
        .expect("notifications")
        .is_empty());
}

#[tokio::test]
async fn create_requires_an_active_subscription() {
    let h = harness();
    h.directory.suspend(UNIT);

    match h.service.create(&rita(), details("Broken window")).await {
        Err(RepairError::Validation { operation, .. }) => assert_eq!(operation, Operation::Create),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(h.store.tickets().expect("tickets").is_empty());
}

#[tokio::test]
async fn assign_company_moves_to_allocation_pending() {
    let h = harness();
    let ticket = h.open_ticket("Leaking sink").await;

    let outcome = h
        .service
        .assign_company(&adam(), &ticket, &company(SANITAER), AssignmentKind::Assigned)
        .await
        .expect("assigned");

    assert_eq!(outcome.ticket.status, TicketStatus::AllocationPending);
    assert_eq!(outcome.ticket.assignee, Some(company(SANITAER)));
    assert!(outcome.ticket.allocated);

    let assigned: Vec<_> = h
        .service
        .history(&ticket)
        .expect("history")
        .into_iter()
        .filter(|entry| entry.event == EventKind::Assigned)
        .collect();
    assert_eq!(assigned.len(), 1);

    let rita_rows = h.service.notifications_for(&user("rita")).expect("rows");
    assert!(rita_rows.iter().any(|row| row.event_kind == EventKind::Assigned));
    let sam_rows = h.service.notifications_for(&user("sam")).expect("rows");
    assert!(sam_rows.iter().any(|row| row.event_kind == EventKind::Assigned));
    let adam_rows = h.service.notifications_for(&user("adam")).expect("rows");
    assert!(
        !adam_rows.iter().any(|row| row.event_kind == EventKind::Assigned),
        "the acting administrator is not notified of their own action"
    );
}

#[tokio::test]
async fn preferred_assignment_leaves_assignee_empty() {
    let h = harness();
    let ticket = h.open_ticket("Flickering light").await;

    let outcome = h
        .service
        .assign_company(&adam(), &ticket, &company(ELEKTRO), AssignmentKind::Preferred)
        .await
        .expect("preference recorded");

    assert_eq!(outcome.ticket.preferred_company, Some(company(ELEKTRO)));
    assert_eq!(outcome.ticket.assignee, None);
    assert!(!outcome.ticket.allocated);
}

#[tokio::test]
async fn reporters_cannot_assign_companies() {
    let h = harness();
    let ticket = h.open_ticket("Leaking sink").await;

    match h
        .service
        .assign_company(&rita(), &ticket, &company(SANITAER), AssignmentKind::Assigned)
        .await
    {
        Err(RepairError::Unauthorized {
            operation, role, ..
        }) => {
            assert_eq!(operation, Operation::AssignCompany);
            assert_eq!(role, Role::Reporter);
        }
        other => panic!("expected unauthorized, got {other:?}"),
    }
    assert_eq!(h.service.history(&ticket).expect("history").len(), 1);
}

#[tokio::test]
async fn claimed_role_must_be_held() {
    let h = harness();
    let ticket = h.open_ticket("Leaking sink").await;
    let impostor = crate::workflows::repairs::domain::Actor::new("rita", Role::Administrator);

    let result = h
        .service
        .assign_company(&impostor, &ticket, &company(SANITAER), AssignmentKind::Assigned)
        .await;
    assert!(matches!(result, Err(RepairError::Unauthorized { .. })));
}

#[tokio::test]
async fn close_outside_repair_confirmed_is_rejected_without_audit_entry() {
    let h = harness();
    let ticket = h.open_ticket("Leaking sink").await;
    let before = h.store.audit_entries().expect("entries").len();

    match h.service.close(&adam(), &ticket, None).await {
        Err(RepairError::InvalidTransition {
            current,
            operation,
            allowed,
            ..
        }) => {
            assert_eq!(current, TicketStatus::Open);
            assert_eq!(operation, Operation::Close);
            assert!(allowed.contains(&TicketStatus::AllocationPending));
            assert!(!allowed.contains(&TicketStatus::Closed));
        }
        other => panic!("expected invalid transition, got {other:?}"),
    }

    assert_eq!(h.store.audit_entries().expect("entries").len(), before);
    assert_eq!(
        h.service.ticket(&ticket).expect("ticket").status,
        TicketStatus::Open
    );
}

#[tokio::test]
async fn mandatory_comment_is_checked_against_target_status() {
    let h = harness_with(RepairConfig {
        comment_required: vec![TicketStatus::RepairConfirmed],
        ..RepairConfig::default()
    });
    let (ticket, _) = h.accepted_ticket().await;

    match h.service.mark_repaired(&sam(), &ticket, None, None).await {
        Err(RepairError::Validation { operation, reason, .. }) => {
            assert_eq!(operation, Operation::MarkRepaired);
            assert!(reason.contains("repair_confirmed"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(
        h.service.ticket(&ticket).expect("ticket").status,
        TicketStatus::OfferAccepted
    );

    let outcome = h
        .service
        .mark_repaired(&sam(), &ticket, None, Some("Seal replaced".to_string()))
        .await
        .expect("repair confirmed with comment");
    assert_eq!(outcome.ticket.status, TicketStatus::RepairConfirmed);
}

#[tokio::test]
async fn signature_required_ticket_waits_for_confirmation_before_close() {
    let h = harness();
    let mut spec = details("Boiler replacement");
    spec.signature_required = true;
    let ticket = h
        .service
        .create(&rita(), spec)
        .await
        .expect("created")
        .ticket
        .id;
    h.accept_on(&ticket).await;

    let repaired = h
        .service
        .mark_repaired(&sam(), &ticket, None, None)
        .await
        .expect("repaired");
    assert_eq!(repaired.ticket.status, TicketStatus::RepairConfirmed);
    assert!(repaired.ticket.signature_pending);

    assert!(matches!(
        h.service.close(&adam(), &ticket, None).await,
        Err(RepairError::Validation { .. })
    ));

    let signed = h
        .service
        .confirm_signature(&rita(), &ticket, DocumentRef("doc-signature".to_string()))
        .await
        .expect("signature confirmed");
    assert!(!signed.ticket.signature_pending);
    assert!(signed
        .ticket
        .documents
        .contains(&DocumentRef("doc-signature".to_string())));

    let closed = h.service.close(&adam(), &ticket, None).await.expect("closed");
    assert_eq!(closed.ticket.status, TicketStatus::Closed);
}

#[tokio::test]
async fn signature_supplied_with_repair_needs_no_confirmation() {
    let h = harness();
    let mut spec = details("Boiler replacement");
    spec.signature_required = true;
    let ticket = h.service.create(&rita(), spec).await.expect("created").ticket.id;
    h.accept_on(&ticket).await;

    let repaired = h
        .service
        .mark_repaired(
            &sam(),
            &ticket,
            Some(DocumentRef("doc-signed-report".to_string())),
            None,
        )
        .await
        .expect("repaired");
    assert!(!repaired.ticket.signature_pending);
    assert!(matches!(
        h.service
            .confirm_signature(&rita(), &ticket, DocumentRef("doc-late".to_string()))
            .await,
        Err(RepairError::Validation { .. })
    ));
}

#[tokio::test]
async fn only_the_assigned_company_reports_progress() {
    let h = harness();
    let (ticket, _) = h.accepted_ticket().await;
    let date = NaiveDate::from_ymd_opt(2026, 11, 3).expect("valid date");

    assert!(matches!(
        h.service.schedule_repair(&eli(), &ticket, date, None).await,
        Err(RepairError::Unauthorized { .. })
    ));

    let scheduled = h
        .service
        .schedule_repair(&sam(), &ticket, date, None)
        .await
        .expect("scheduled");
    assert_eq!(scheduled.ticket.status, TicketStatus::RepairScheduled);
    assert_eq!(scheduled.ticket.repair_date, Some(date));

    let repaired = h
        .service
        .mark_repaired(&jana(), &ticket, None, None)
        .await
        .expect("janitor confirms the repair");
    assert_eq!(repaired.ticket.status, TicketStatus::RepairConfirmed);
}

#[tokio::test]
async fn cancel_needs_a_reason_and_retires_open_requests() {
    let h = harness();
    let ticket = h.solicited_ticket().await;

    assert!(matches!(
        h.service.cancel(&rita(), &ticket, "   ").await,
        Err(RepairError::Validation { .. })
    ));

    let cancelled = h
        .service
        .cancel(&rita(), &ticket, "Fixed it myself")
        .await
        .expect("cancelled");
    assert_eq!(cancelled.ticket.status, TicketStatus::Cancelled);

    let requests = h.store.offer_requests(&ticket).expect("requests");
    assert!(requests
        .iter()
        .all(|request| request.status == OfferRequestStatus::Superseded));

    let last = h.service.history(&ticket).expect("history").pop().expect("entry");
    assert_eq!(last.comment.as_deref(), Some("Fixed it myself"));

    assert!(matches!(
        h.service.comment(&adam(), &ticket, "still dripping?").await,
        Ok(_)
    ));
    assert!(matches!(
        h.service.reject(&adam(), &ticket, "duplicate").await,
        Err(RepairError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn split_delegates_work_to_children() {
    let h = harness();
    let ticket = h.open_ticket("Water damage in bathroom").await;

    let outcome = h
        .service
        .split(
            &adam(),
            &ticket,
            vec![details("Replace tiles"), details("Dry out wall")],
            Some("Two trades needed".to_string()),
        )
        .await
        .expect("split");

    assert_eq!(outcome.ticket.status, TicketStatus::Delegated);
    assert_eq!(outcome.children.len(), 2);
    for child in &outcome.children {
        assert_eq!(child.status, TicketStatus::Open);
        assert_eq!(child.parent.as_ref(), Some(&ticket));
        assert_eq!(child.owner, user("rita"));
        let history = h.service.history(&child.id).expect("child history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event, EventKind::SplitFrom);
        assert_eq!(history[0].payload.related_tickets, vec![ticket.clone()]);
        let status_text = history[0]
            .payload
            .status_text
            .as_ref()
            .expect("child entry carries the status text");
        assert_eq!(status_text.en, "Open");
        assert_eq!(
            history[0].payload.responsible_users,
            vec![user("olivia"), user("adam"), user("jana")]
        );
    }
    assert_eq!(h.service.children(&ticket).expect("children").len(), 2);

    match h
        .service
        .assign_company(&adam(), &ticket, &company(SANITAER), AssignmentKind::Assigned)
        .await
    {
        Err(RepairError::InvalidTransition { current, .. }) => {
            assert_eq!(current, TicketStatus::Delegated)
        }
        other => panic!("expected invalid transition, got {other:?}"),
    }
}

#[tokio::test]
async fn janitors_cannot_split() {
    let h = harness();
    let ticket = h.open_ticket("Water damage").await;

    assert!(matches!(
        h.service
            .split(&jana(), &ticket, vec![details("Tiles")], None)
            .await,
        Err(RepairError::Unauthorized { .. })
    ));
}

#[tokio::test]
async fn comment_keeps_status_and_bumps_version() {
    let h = harness();
    let ticket = h.open_ticket("Leaking sink").await;
    let before = h.service.ticket(&ticket).expect("ticket");

    let outcome = h
        .service
        .comment(&jana(), &ticket, "Shut off the water supply")
        .await
        .expect("commented");

    assert_eq!(outcome.ticket.status, TicketStatus::Open);
    assert_eq!(outcome.ticket.version, before.version + 1);
    assert_eq!(
        h.service.ticket(&ticket).expect("ticket").version,
        before.version + 1
    );

    let rita_rows = h.service.notifications_for(&user("rita")).expect("rows");
    assert!(rita_rows.iter().any(|row| row.event_kind == EventKind::Commented));
    let jana_rows = h.service.notifications_for(&user("jana")).expect("rows");
    assert!(!jana_rows.iter().any(|row| row.event_kind == EventKind::Commented));
}

#[tokio::test]
async fn ticket_locks_are_released_after_each_operation() {
    let h = harness();
    let ticket = h.open_ticket("Leaking sink").await;

    h.service
        .comment(&jana(), &ticket, "Shut off the water supply")
        .await
        .expect("commented");
    assert_eq!(h.service.tracked_locks(), 0);

    assert!(matches!(
        h.service.close(&adam(), &ticket, None).await,
        Err(RepairError::InvalidTransition { .. })
    ));
    assert_eq!(h.service.tracked_locks(), 0);

    let unknown = TicketId("dmg-missing".to_string());
    assert!(matches!(
        h.service.comment(&jana(), &unknown, "Anyone there?").await,
        Err(RepairError::NotFound { .. })
    ));
    assert_eq!(h.service.tracked_locks(), 0);
}

#[tokio::test]
async fn deleted_tickets_resolve_as_not_found_but_keep_history() {
    let h = harness();
    let ticket = h.open_ticket("Leaking sink").await;

    h.service
        .delete(&adam(), &ticket, Some("test entry".to_string()))
        .await
        .expect("deleted");

    assert!(matches!(
        h.service.ticket(&ticket),
        Err(RepairError::NotFound { entity: "ticket", .. })
    ));
    assert!(matches!(
        h.service.comment(&adam(), &ticket, "anyone?").await,
        Err(RepairError::NotFound { .. })
    ));

    let events: Vec<EventKind> = h
        .service
        .history(&ticket)
        .expect("history")
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert_eq!(events, vec![EventKind::Created, EventKind::Deleted]);
}

#[tokio::test]
async fn audit_replay_reproduces_current_status() {
    let h = harness();
    let ticket = h.closed_ticket().await;

    let history = h.service.history(&ticket).expect("history");
    assert_eq!(
        replay_status(&history),
        Some(h.store.ticket(&ticket).expect("read").expect("stored").status)
    );
    assert_eq!(
        status_trail(&history),
        vec![
            TicketStatus::Open,
            TicketStatus::AllocationPending,
            TicketStatus::OfferRequested,
            TicketStatus::OfferReceived,
            TicketStatus::OfferAccepted,
            TicketStatus::RepairConfirmed,
            TicketStatus::Closed,
        ]
    );
    assert!(history
        .iter()
        .all(|entry| entry.payload.status_text.is_some()));
    assert_eq!(
        history[0].payload.responsible_users,
        vec![user("olivia"), user("adam"), user("jana")]
    );
}

#[tokio::test]
async fn history_by_actor_lists_only_that_users_entries() {
    let h = harness();
    h.solicited_ticket().await;

    let entries = h.service.history_by_actor(&user("adam")).expect("entries");
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|entry| entry.actor == user("adam")));
}
