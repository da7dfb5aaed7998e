use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::domain::{Actor, CompanyId, CompanyRating, Ticket};
use super::error::RepairError;
use super::repository::{RatingStore, RepositoryError};
use super::status::{allowed_next, Operation, TicketStatus};

/// Aggregate read model over a company's ratings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reputation {
    pub company: CompanyId,
    pub count: usize,
    pub average: Option<f64>,
}

/// Records post-closure scores and answers reputation queries.
pub struct RatingBook<S: ?Sized> {
    store: Arc<S>,
    scale: u8,
}

impl<S: ?Sized> Clone for RatingBook<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            scale: self.scale,
        }
    }
}

impl<S> RatingBook<S>
where
    S: RatingStore + ?Sized,
{
    pub fn new(store: Arc<S>, scale: u8) -> Self {
        Self { store, scale }
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    /// Rate `company` for its work on `ticket`.
    ///
    /// `participants` are the companies that actually worked the ticket (assignee and the
    /// company of the active offer). A second rating for the same pair fails with
    /// [`RepairError::AlreadyRated`] and leaves the first one in place.
    pub fn rate(
        &self,
        rater: &Actor,
        ticket: &Ticket,
        company: &CompanyId,
        participants: &[CompanyId],
        score: u8,
    ) -> Result<CompanyRating, RepairError> {
        let operation = Operation::Rate;

        if ticket.status != TicketStatus::Closed {
            return Err(RepairError::InvalidTransition {
                ticket: ticket.id.clone(),
                operation,
                current: ticket.status,
                allowed: allowed_next(ticket.status),
            });
        }
        if !(1..=self.scale).contains(&score) {
            return Err(RepairError::validation(
                Some(&ticket.id),
                operation,
                format!("score {score} is outside 1..={}", self.scale),
            ));
        }
        if !participants.contains(company) {
            return Err(RepairError::validation(
                Some(&ticket.id),
                operation,
                format!("{company} did not work on this ticket"),
            ));
        }

        let existing = self
            .store
            .rating(company, &ticket.id)
            .map_err(|err| RepairError::from_repository(Some(&ticket.id), operation, err))?;
        if existing.is_some() {
            return Err(RepairError::AlreadyRated {
                ticket: ticket.id.clone(),
                company: company.clone(),
            });
        }

        let rating = CompanyRating {
            company: company.clone(),
            ticket: ticket.id.clone(),
            rater: rater.user.clone(),
            score,
            rated_at: Utc::now(),
        };
        match self.store.insert_rating(rating.clone()) {
            Ok(()) => Ok(rating),
            Err(RepositoryError::Duplicate) => Err(RepairError::AlreadyRated {
                ticket: ticket.id.clone(),
                company: company.clone(),
            }),
            Err(err) => Err(RepairError::from_repository(Some(&ticket.id), operation, err)),
        }
    }

    pub fn reputation(&self, company: &CompanyId) -> Result<Reputation, RepairError> {
        let ratings = self
            .store
            .ratings_for_company(company)
            .map_err(|err| RepairError::from_repository(None, Operation::Rate, err))?;
        let count = ratings.len();
        let average = (count > 0).then(|| {
            let sum: u64 = ratings.iter().map(|rating| u64::from(rating.score)).sum();
            sum as f64 / count as f64
        });
        Ok(Reputation {
            company: company.clone(),
            count,
            average,
        })
    }
}
