use crate::infra::{demo_world, parse_date, DemoWorld, DEMO_COMPANY, DEMO_UNIT};
use chrono::{Duration, Local, NaiveDate};
use clap::Args;
use std::collections::BTreeMap;
use tenant_repairs::config::{AppConfig, RepairConfig};
use tenant_repairs::error::AppError;
use tenant_repairs::telemetry;
use tenant_repairs::workflows::repairs::{
    Actor, AssignmentKind, AuditEntry, Bid, CompanyId, CostCategory, DocumentRef, LineItem,
    Locale, OfferTarget, Role, StatusCatalog, TicketDetails, TicketId,
    TransitionOutcome, UnitId, UserId,
};

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Require the reporter's signature before the ticket can be closed.
    #[arg(long)]
    pub(crate) signature_required: bool,
    /// Planned repair date (YYYY-MM-DD). Defaults to three days from today.
    #[arg(long, value_parser = parse_date)]
    pub(crate) repair_date: Option<NaiveDate>,
    /// Score the reporter gives the company after closure.
    #[arg(long, default_value_t = 5)]
    pub(crate) score: u8,
    /// Print the audit trail as JSON lines instead of a table.
    #[arg(long)]
    pub(crate) json: bool,
    /// Emit workflow tracing to stderr using the configured log level.
    #[arg(long)]
    pub(crate) verbose: bool,
}

fn reporter() -> Actor {
    Actor::new("mara.keller", Role::Reporter)
}

fn administrator() -> Actor {
    Actor::new("thomas.frei", Role::Administrator)
}

fn owner() -> Actor {
    Actor::new("vera.huber", Role::Owner)
}

fn plumber() -> Actor {
    Actor::new("luca.brunner", Role::Company)
}

pub(crate) fn print_status_catalog() -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let catalog = StatusCatalog::from_config(&config.repairs);

    println!("{:<20} {:<24} {:<24} comment", "key", "label (de)", "label (en)");
    for definition in catalog.definitions() {
        println!(
            "{:<20} {:<24} {:<24} {}",
            definition.key,
            definition.label.get(Locale::De),
            definition.label.get(Locale::En),
            if definition.comment_required {
                "required"
            } else {
                "-"
            }
        );
    }
    Ok(())
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        signature_required,
        repair_date,
        score,
        json,
        verbose,
    } = args;

    let config = AppConfig::load()?;
    if verbose {
        telemetry::init(&config.telemetry)?;
    }
    let repair_date =
        repair_date.unwrap_or_else(|| Local::now().date_naive() + Duration::days(3));

    println!("Damage report demo");
    print_config(&config.repairs);

    let world = demo_world(config.repairs.clone());
    let ticket = walk_lifecycle(
        &world,
        signature_required,
        repair_date,
        score,
        config.repairs.rating_scale,
    )
    .await?;

    let history = world.service.history(&ticket)?;
    println!("\nAudit trail for {ticket} ({} entries)", history.len());
    if json {
        for entry in &history {
            println!("{}", serde_json::to_string(entry).unwrap_or_default());
        }
    } else {
        render_history(&history);
    }

    render_notifications(&world)?;
    Ok(())
}

async fn walk_lifecycle(
    world: &DemoWorld,
    signature_required: bool,
    repair_date: NaiveDate,
    score: u8,
    rating_scale: u8,
) -> Result<TicketId, AppError> {
    let service = &world.service;
    let company = CompanyId(DEMO_COMPANY.to_string());

    let created = service
        .create(
            &reporter(),
            TicketDetails {
                unit: UnitId(DEMO_UNIT.to_string()),
                title: "Wasser tropft unter dem Lavabo".to_string(),
                description: "Siphon leaks, cabinet floor is soaked".to_string(),
                location: "3. OG, Badezimmer".to_string(),
                device_affected: true,
                signature_required,
                documents: vec![DocumentRef("photos/lavabo-1.jpg".to_string())],
            },
        )
        .await?;
    let ticket = created.ticket.id.clone();
    step("reporter filed the damage report", &created);

    let assigned = service
        .assign_company(&administrator(), &ticket, &company, AssignmentKind::Preferred)
        .await?;
    step("administrator named a preferred company", &assigned);

    let requested = service
        .request_offer(
            &administrator(),
            &ticket,
            OfferTarget::Registered(company.clone()),
            Some("Please include disposal of the old siphon".to_string()),
        )
        .await?;
    step("offer requested from the registered company", &requested);

    let by_mail = service
        .request_offer(
            &administrator(),
            &ticket,
            OfferTarget::Unregistered {
                email: "offerte@rohrblitz.ch".to_string(),
            },
            None,
        )
        .await?;
    step("offer requested by e-mail from an unregistered company", &by_mail);

    let mut first_bid = Bid::new("Replace siphon and seal the drain", 1_480);
    first_bid.line_items = vec![
        LineItem {
            label: "Siphon and seals".to_string(),
            amount: 380,
        },
        LineItem {
            label: "Labour, 2.5 h".to_string(),
            amount: 1_100,
        },
    ];
    first_bid.price_split = BTreeMap::from([
        (CostCategory::Material, 380),
        (CostCategory::Labour, 1_100),
    ]);
    let submitted = service.submit_offer(&plumber(), &ticket, first_bid).await?;
    step("company submitted a bid of 1480", &submitted);
    let first_offer = submitted.offer.as_ref().map(|offer| offer.id.clone());

    if let Some(offer) = &first_offer {
        let accepted = service.accept_offer(&owner(), &ticket, offer).await?;
        step("owner accepted the bid", &accepted);
    }

    let revised = service
        .submit_offer(
            &plumber(),
            &ticket,
            Bid::new("Replace siphon only, drain is fine", 1_320),
        )
        .await?;
    step("company revised its bid to 1320", &revised);
    if let Some(offer) = &revised.offer {
        let accepted = service.accept_offer(&owner(), &ticket, &offer.id).await?;
        step("owner accepted the revised bid", &accepted);
    }

    let scheduled = service
        .schedule_repair(&plumber(), &ticket, repair_date, None)
        .await?;
    step(&format!("repair scheduled for {repair_date}"), &scheduled);

    let repaired = service
        .mark_repaired(
            &plumber(),
            &ticket,
            None,
            Some("Siphon replaced, no further damage".to_string()),
        )
        .await?;
    step("company reported the repair as done", &repaired);

    if repaired.ticket.signature_pending {
        let signed = service
            .confirm_signature(
                &reporter(),
                &ticket,
                DocumentRef("signatures/mara-keller.pdf".to_string()),
            )
            .await?;
        step("reporter signed the completion report", &signed);
    }

    let closed = service
        .close(&administrator(), &ticket, Some("Invoice forwarded".to_string()))
        .await?;
    step("administrator closed the ticket", &closed);

    let rating = service.rate(&reporter(), &ticket, &company, score)?;
    let reputation = service.reputation(&company)?;
    println!(
        "  {:<20} reporter rated {} with {}/{} (average {:.1} over {} rating(s))",
        "",
        rating.company,
        rating.score,
        rating_scale,
        reputation.average.unwrap_or_default(),
        reputation.count
    );

    Ok(ticket)
}

fn step(label: &str, outcome: &TransitionOutcome) {
    println!("  {:<20} {label}", outcome.ticket.status.key());
    for warning in &outcome.warnings {
        println!(
            "  {:<20} warning: {} not notified ({})",
            "", warning.recipient, warning.reason
        );
    }
}

fn print_config(config: &RepairConfig) {
    let commented: Vec<&str> = config
        .comment_required
        .iter()
        .map(|status| status.key())
        .collect();
    println!(
        "Comments required for: {} | transport timeout: {} ms | direct offers: {}",
        if commented.is_empty() {
            "-".to_string()
        } else {
            commented.join(", ")
        },
        config.transport_timeout.as_millis(),
        if config.allow_direct_offers { "yes" } else { "no" }
    );
}

fn render_history(history: &[AuditEntry]) {
    println!(
        "{:<10} {:<24} {:<20} {:<28} comment",
        "time", "event", "status", "actor"
    );
    for entry in history {
        println!(
            "{:<10} {:<24} {:<20} {:<28} {}",
            entry.recorded_at.format("%H:%M:%S"),
            entry.event.key(),
            entry.status.key(),
            format!("{} ({})", entry.actor, entry.actor_role.label()),
            entry.comment.as_deref().unwrap_or("-")
        );
    }
}

fn render_notifications(world: &DemoWorld) -> Result<(), AppError> {
    let deliveries = world.transport.deliveries();
    println!("\nNotifications ({} delivered)", deliveries.len());

    let mut per_recipient: BTreeMap<String, usize> = BTreeMap::new();
    for delivery in &deliveries {
        *per_recipient.entry(delivery.recipient.to_string()).or_default() += 1;
    }
    for (recipient, count) in &per_recipient {
        println!("  {recipient:<36} {count}");
    }

    for user in ["vera.huber", "thomas.frei", "mara.keller"] {
        let rows = world.service.notifications_for(&UserId(user.to_string()))?;
        let unread = rows.iter().filter(|row| !row.read).count();
        let latest = rows.last().map(|row| row.text.get(Locale::De));
        println!(
            "  {user:<20} unread {unread:>2}  latest: {}",
            latest.unwrap_or("-")
        );
    }

    let stored = world
        .store
        .notifications()
        .map_err(|err| AppError::Io(std::io::Error::other(err.to_string())))?;
    let undelivered = stored.iter().filter(|row| !row.delivered).count();
    if undelivered > 0 {
        println!("  {undelivered} notification(s) still awaiting delivery");
    }
    Ok(())
}
