//! Offer solicitation and bidding between a ticket owner and repair companies.
//!
//! Every mutation is first computed as a [`NegotiationChange`] against the current records
//! (`plan_*`), so the lifecycle can commit it together with the ticket transition. The
//! standalone methods commit a plan on their own. Either way the store re-checks the two
//! uniqueness rules (one open request per company, one active offer per ticket) when the
//! batch is applied, so a plan built from stale reads is refused rather than applied.

use std::sync::Arc;

use chrono::Utc;

use super::domain::{
    Bid, CompanyId, CompanyKey, HasAttachableDocument, Offer, OfferId, OfferRequest,
    OfferRequestId, OfferRequestStatus, OfferTarget, TicketId,
};
use super::error::RepairError;
use super::repository::{CommitBatch, RepairRepository, RepositoryError};
use super::status::Operation;

/// Request and offer rows a negotiation step writes.
#[derive(Debug, Clone, Default)]
pub struct NegotiationChange {
    pub requests: Vec<OfferRequest>,
    pub offers: Vec<Offer>,
}

impl NegotiationChange {
    pub fn into_batch(self) -> CommitBatch {
        CommitBatch {
            requests: self.requests,
            offers: self.offers,
            ..CommitBatch::default()
        }
    }
}

/// Outcome of soliciting a company.
#[derive(Debug, Clone)]
pub struct Solicitation {
    pub request: OfferRequest,
    /// `true` when an already open request was re-issued instead of creating a new one.
    pub reissued: bool,
    pub change: NegotiationChange,
}

#[derive(Debug, Clone)]
pub struct BidPlacement {
    pub offer: Offer,
    pub change: NegotiationChange,
}

#[derive(Debug, Clone)]
pub struct Activation {
    pub offer: Offer,
    pub deactivated: Vec<OfferId>,
    pub change: NegotiationChange,
}

pub struct OfferNegotiation<R: ?Sized> {
    repository: Arc<R>,
}

impl<R: ?Sized> Clone for OfferNegotiation<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

impl<R> OfferNegotiation<R>
where
    R: RepairRepository + ?Sized,
{
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// Requests for the ticket that are neither declined nor superseded.
    pub fn open_requests(&self, ticket: &TicketId) -> Result<Vec<OfferRequest>, RepairError> {
        let requests = self
            .repository
            .offer_requests(ticket)
            .map_err(storage(ticket, Operation::RequestOffer))?;
        Ok(requests.into_iter().filter(OfferRequest::is_open).collect())
    }

    fn open_request_for(
        &self,
        ticket: &TicketId,
        company: &CompanyKey,
        operation: Operation,
    ) -> Result<Option<OfferRequest>, RepairError> {
        let requests = self
            .repository
            .offer_requests(ticket)
            .map_err(storage(ticket, operation))?;
        Ok(requests
            .into_iter()
            .find(|request| request.is_open() && &request.company_key() == company))
    }

    fn load_request(
        &self,
        id: &OfferRequestId,
        operation: Operation,
    ) -> Result<OfferRequest, RepairError> {
        self.repository
            .offer_request(id)
            .map_err(|err| RepairError::from_repository(None, operation, err))?
            .ok_or_else(|| RepairError::not_found(None, operation, "offer request", id))
    }

    /// New request; refuses when the company already has an open one for the ticket.
    pub fn plan_open_request(
        &self,
        ticket: &TicketId,
        target: &OfferTarget,
        contact_email: Option<String>,
        comment: Option<String>,
        operation: Operation,
    ) -> Result<Solicitation, RepairError> {
        let key = target.key();
        if self.open_request_for(ticket, &key, operation)?.is_some() {
            return Err(RepairError::DuplicateOpenRequest {
                ticket: ticket.clone(),
                operation,
                company: key,
            });
        }

        let (company, contact_email) = match target {
            OfferTarget::Registered(company) => (Some(company.clone()), contact_email),
            OfferTarget::Unregistered { email } => {
                let email = email.trim().to_string();
                if !email.contains('@') {
                    return Err(RepairError::validation(
                        Some(ticket),
                        operation,
                        format!("'{email}' is not a usable contact e-mail"),
                    ));
                }
                (None, Some(email))
            }
        };

        let request = OfferRequest {
            id: OfferRequestId::next(),
            ticket: ticket.clone(),
            company,
            contact_email,
            requested_at: Utc::now(),
            re_requested_at: None,
            rejected_at: None,
            status: OfferRequestStatus::Requested,
            comment,
        };

        Ok(Solicitation {
            change: NegotiationChange {
                requests: vec![request.clone()],
                offers: Vec::new(),
            },
            request,
            reissued: false,
        })
    }

    /// Open a request, or re-issue the company's open one. Declined requests stay untouched.
    pub fn plan_solicit(
        &self,
        ticket: &TicketId,
        target: &OfferTarget,
        contact_email: Option<String>,
        comment: Option<String>,
        operation: Operation,
    ) -> Result<Solicitation, RepairError> {
        match self.open_request_for(ticket, &target.key(), operation)? {
            Some(open) => {
                let mut request = reissue(open);
                if comment.is_some() {
                    request.comment = comment;
                }
                Ok(Solicitation {
                    change: NegotiationChange {
                        requests: vec![request.clone()],
                        offers: Vec::new(),
                    },
                    request,
                    reissued: true,
                })
            }
            None => self.plan_open_request(ticket, target, contact_email, comment, operation),
        }
    }

    /// Ask for a revised bid on an open request.
    pub fn plan_re_request(
        &self,
        request: &OfferRequestId,
        operation: Operation,
    ) -> Result<Solicitation, RepairError> {
        let current = self.load_request(request, operation)?;
        if !current.is_open() {
            return Err(RepairError::validation(
                Some(&current.ticket),
                operation,
                format!("offer request {} is no longer open", current.id),
            ));
        }
        let request = reissue(current);
        Ok(Solicitation {
            change: NegotiationChange {
                requests: vec![request.clone()],
                offers: Vec::new(),
            },
            request,
            reissued: true,
        })
    }

    /// The company declines to bid.
    pub fn plan_reject_request(
        &self,
        request: &OfferRequestId,
        reason: &str,
        operation: Operation,
    ) -> Result<(OfferRequest, NegotiationChange), RepairError> {
        let mut current = self.load_request(request, operation)?;
        if reason.trim().is_empty() {
            return Err(RepairError::validation(
                Some(&current.ticket),
                operation,
                "declining an offer request needs a reason",
            ));
        }
        if !current.is_open() {
            return Err(RepairError::validation(
                Some(&current.ticket),
                operation,
                format!("offer request {} is no longer open", current.id),
            ));
        }

        current.rejected_at = Some(Utc::now());
        current.status = OfferRequestStatus::Rejected;
        current.comment = Some(reason.trim().to_string());

        let change = NegotiationChange {
            requests: vec![current.clone()],
            offers: Vec::new(),
        };
        Ok((current, change))
    }

    /// Record a bid. It needs an open request for the company unless `allow_direct` is set.
    pub fn plan_submit_bid(
        &self,
        ticket: &TicketId,
        company: &CompanyId,
        bid: Bid,
        allow_direct: bool,
        operation: Operation,
    ) -> Result<BidPlacement, RepairError> {
        if let Some(defect) = bid.defect() {
            return Err(RepairError::validation(Some(ticket), operation, defect));
        }

        let key = CompanyKey::Registered(company.clone());
        let request = match &bid.request {
            Some(id) => {
                let request = self.load_request(id, operation)?;
                if &request.ticket != ticket || request.company_key() != key {
                    return Err(RepairError::validation(
                        Some(ticket),
                        operation,
                        format!("offer request {id} was not sent to {company} for this ticket"),
                    ));
                }
                if !request.is_open() {
                    return Err(RepairError::validation(
                        Some(ticket),
                        operation,
                        format!("offer request {id} is no longer open"),
                    ));
                }
                Some(request)
            }
            None => self.open_request_for(ticket, &key, operation)?,
        };

        if request.is_none() && !allow_direct {
            return Err(RepairError::validation(
                Some(ticket),
                operation,
                format!("{company} has no open offer request for this ticket"),
            ));
        }

        let Bid {
            description,
            total,
            line_items,
            price_split,
            document,
            ..
        } = bid;

        let mut offer = Offer {
            id: OfferId::next(),
            ticket: ticket.clone(),
            company: company.clone(),
            request: request.as_ref().map(|request| request.id.clone()),
            description: description.trim().to_string(),
            total,
            line_items,
            price_split,
            documents: Vec::new(),
            accepted: false,
            active: false,
            accepted_at: None,
            submitted_at: Utc::now(),
        };
        if let Some(document) = document {
            offer.attach(document);
        }

        let mut change = NegotiationChange {
            requests: Vec::new(),
            offers: vec![offer.clone()],
        };
        if let Some(mut request) = request {
            request.status = OfferRequestStatus::OfferSubmitted;
            change.requests.push(request);
        }

        Ok(BidPlacement { offer, change })
    }

    /// Make `offer` the binding one, deactivating whichever offer held that place.
    pub fn plan_activate(
        &self,
        offer: &OfferId,
        operation: Operation,
    ) -> Result<Activation, RepairError> {
        let target = self
            .repository
            .offer(offer)
            .map_err(|err| RepairError::from_repository(None, operation, err))?
            .ok_or_else(|| RepairError::not_found(None, operation, "offer", offer))?;
        let siblings = self
            .repository
            .offers(&target.ticket)
            .map_err(storage(&target.ticket, operation))?;

        let mut change = NegotiationChange::default();
        let mut deactivated = Vec::new();
        for mut sibling in siblings {
            if sibling.id != target.id && sibling.active {
                sibling.active = false;
                deactivated.push(sibling.id.clone());
                change.offers.push(sibling);
            }
        }

        let mut activated = target;
        activated.active = true;
        if !activated.accepted {
            activated.accepted = true;
            activated.accepted_at = Some(Utc::now());
        }
        change.offers.push(activated.clone());

        Ok(Activation {
            offer: activated,
            deactivated,
            change,
        })
    }

    /// Bids for the ticket in submission order.
    pub fn list_bids(&self, ticket: &TicketId) -> Result<Vec<Offer>, RepairError> {
        let mut offers = self
            .repository
            .offers(ticket)
            .map_err(storage(ticket, Operation::SubmitOffer))?;
        offers.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        Ok(offers)
    }

    pub fn active_offer(&self, ticket: &TicketId) -> Result<Option<Offer>, RepairError> {
        let offers = self
            .repository
            .offers(ticket)
            .map_err(storage(ticket, Operation::AcceptOffer))?;
        Ok(offers.into_iter().find(|offer| offer.active))
    }

    fn apply(
        &self,
        ticket: &TicketId,
        operation: Operation,
        change: NegotiationChange,
    ) -> Result<(), RepairError> {
        self.repository
            .commit(change.into_batch())
            .map_err(storage(ticket, operation))
    }

    pub fn open_request(
        &self,
        ticket: &TicketId,
        target: &OfferTarget,
        contact_email: Option<String>,
    ) -> Result<OfferRequest, RepairError> {
        let plan =
            self.plan_open_request(ticket, target, contact_email, None, Operation::RequestOffer)?;
        self.apply(ticket, Operation::RequestOffer, plan.change)?;
        Ok(plan.request)
    }

    pub fn re_request(&self, request: &OfferRequestId) -> Result<OfferRequest, RepairError> {
        let plan = self.plan_re_request(request, Operation::RequestOffer)?;
        self.apply(&plan.request.ticket, Operation::RequestOffer, plan.change)?;
        Ok(plan.request)
    }

    pub fn reject_request(
        &self,
        request: &OfferRequestId,
        reason: &str,
    ) -> Result<OfferRequest, RepairError> {
        let (request, change) =
            self.plan_reject_request(request, reason, Operation::DeclineRequest)?;
        self.apply(&request.ticket, Operation::DeclineRequest, change)?;
        Ok(request)
    }

    pub fn submit_bid(
        &self,
        ticket: &TicketId,
        company: &CompanyId,
        bid: Bid,
        allow_direct: bool,
    ) -> Result<Offer, RepairError> {
        let plan =
            self.plan_submit_bid(ticket, company, bid, allow_direct, Operation::SubmitOffer)?;
        self.apply(ticket, Operation::SubmitOffer, plan.change)?;
        Ok(plan.offer)
    }

    pub fn activate(&self, offer: &OfferId) -> Result<Activation, RepairError> {
        let activation = self.plan_activate(offer, Operation::AcceptOffer)?;
        self.apply(
            &activation.offer.ticket,
            Operation::AcceptOffer,
            activation.change.clone(),
        )?;
        Ok(activation)
    }
}

fn storage(ticket: &TicketId, operation: Operation) -> impl Fn(RepositoryError) -> RepairError {
    let ticket = ticket.clone();
    move |err| RepairError::from_repository(Some(&ticket), operation, err)
}

fn reissue(mut request: OfferRequest) -> OfferRequest {
    request.re_requested_at = Some(Utc::now());
    request.status = OfferRequestStatus::Requested;
    request
}
