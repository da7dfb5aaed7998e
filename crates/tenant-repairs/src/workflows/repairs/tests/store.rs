use std::collections::BTreeMap;

use chrono::Utc;

use super::common::*;
use crate::workflows::repairs::domain::{
    CompanyKey, Offer, OfferId, OfferRequest, OfferRequestId, OfferRequestStatus, Ticket, TicketId,
};
use crate::workflows::repairs::memory::InMemoryRepairStore;
use crate::workflows::repairs::repository::{
    CommitBatch, RepairRepository, RepositoryError, TicketWrite,
};

fn stored_ticket(store: &InMemoryRepairStore) -> Ticket {
    let ticket = Ticket::open(details("Leaking sink"), &rita(), None);
    store
        .commit(CommitBatch {
            tickets: vec![TicketWrite {
                ticket: ticket.clone(),
                expected_version: None,
            }],
            ..CommitBatch::default()
        })
        .expect("ticket inserted");
    ticket
}

fn offer(ticket: &TicketId, company_id: &str, active: bool) -> Offer {
    Offer {
        id: OfferId::next(),
        ticket: ticket.clone(),
        company: company(company_id),
        request: None,
        description: "Replace siphon".to_string(),
        total: 500,
        line_items: Vec::new(),
        price_split: BTreeMap::new(),
        documents: Vec::new(),
        accepted: active,
        active,
        accepted_at: active.then(Utc::now),
        submitted_at: Utc::now(),
    }
}

fn request(ticket: &TicketId, company_id: &str) -> OfferRequest {
    OfferRequest {
        id: OfferRequestId::next(),
        ticket: ticket.clone(),
        company: Some(company(company_id)),
        contact_email: None,
        requested_at: Utc::now(),
        re_requested_at: None,
        rejected_at: None,
        status: OfferRequestStatus::Requested,
        comment: None,
    }
}

#[test]
fn commit_refuses_a_second_active_offer() {
    let store = InMemoryRepairStore::new();
    let ticket = stored_ticket(&store);
    let incumbent = offer(&ticket.id, SANITAER, true);
    store
        .commit(CommitBatch {
            offers: vec![incumbent.clone()],
            ..CommitBatch::default()
        })
        .expect("first active offer");

    let challenger = offer(&ticket.id, ELEKTRO, true);
    match store.commit(CommitBatch {
        offers: vec![challenger.clone()],
        ..CommitBatch::default()
    }) {
        Err(RepositoryError::ActiveOfferConflict { active, .. }) => {
            assert_eq!(active, incumbent.id)
        }
        other => panic!("expected active offer conflict, got {other:?}"),
    }
    assert!(store.offer(&challenger.id).expect("read").is_none());

    let mut retired = incumbent.clone();
    retired.active = false;
    store
        .commit(CommitBatch {
            offers: vec![retired, challenger.clone()],
            ..CommitBatch::default()
        })
        .expect("swap in one batch");
    let active: Vec<_> = store
        .offers(&ticket.id)
        .expect("offers")
        .into_iter()
        .filter(|offer| offer.active)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, challenger.id);
}

#[test]
fn commit_refuses_two_open_requests_for_one_company() {
    let store = InMemoryRepairStore::new();
    let ticket = stored_ticket(&store);
    store
        .commit(CommitBatch {
            requests: vec![request(&ticket.id, SANITAER)],
            ..CommitBatch::default()
        })
        .expect("first request");

    match store.commit(CommitBatch {
        requests: vec![request(&ticket.id, SANITAER)],
        ..CommitBatch::default()
    }) {
        Err(RepositoryError::OpenRequestConflict { company: key, .. }) => {
            assert_eq!(key, CompanyKey::Registered(company(SANITAER)))
        }
        other => panic!("expected open request conflict, got {other:?}"),
    }

    store
        .commit(CommitBatch {
            requests: vec![request(&ticket.id, ELEKTRO)],
            ..CommitBatch::default()
        })
        .expect("other company");
    assert_eq!(store.offer_requests(&ticket.id).expect("requests").len(), 2);
}

#[test]
fn stale_versions_are_rejected_and_nothing_is_applied() {
    let store = InMemoryRepairStore::new();
    let ticket = stored_ticket(&store);

    let mut first = ticket.clone();
    first.title = "Leaking sink (kitchen)".to_string();
    store
        .commit(CommitBatch {
            tickets: vec![TicketWrite {
                ticket: first,
                expected_version: Some(0),
            }],
            ..CommitBatch::default()
        })
        .expect("first writer wins");

    let mut stale = ticket.clone();
    stale.title = "Stale title".to_string();
    let stray = request(&ticket.id, SANITAER);
    match store.commit(CommitBatch {
        tickets: vec![TicketWrite {
            ticket: stale,
            expected_version: Some(0),
        }],
        requests: vec![stray.clone()],
        ..CommitBatch::default()
    }) {
        Err(RepositoryError::VersionConflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected version conflict, got {other:?}"),
    }

    let current = store.ticket(&ticket.id).expect("read").expect("stored");
    assert_eq!(current.title, "Leaking sink (kitchen)");
    assert_eq!(current.version, 1);
    assert!(store.offer_request(&stray.id).expect("read").is_none());
}

#[test]
fn inserting_an_existing_ticket_is_a_duplicate() {
    let store = InMemoryRepairStore::new();
    let ticket = stored_ticket(&store);

    assert!(matches!(
        store.commit(CommitBatch {
            tickets: vec![TicketWrite {
                ticket,
                expected_version: None,
            }],
            ..CommitBatch::default()
        }),
        Err(RepositoryError::Duplicate)
    ));
}

#[test]
fn deleted_tickets_are_not_checked_for_conflicts() {
    let store = InMemoryRepairStore::new();
    let mut ticket = stored_ticket(&store);
    store
        .commit(CommitBatch {
            offers: vec![offer(&ticket.id, SANITAER, true)],
            ..CommitBatch::default()
        })
        .expect("active offer");

    ticket.deleted = true;
    store
        .commit(CommitBatch {
            tickets: vec![TicketWrite {
                ticket: ticket.clone(),
                expected_version: Some(0),
            }],
            offers: vec![offer(&ticket.id, ELEKTRO, true)],
            ..CommitBatch::default()
        })
        .expect("deleted ticket skips validation");
}
