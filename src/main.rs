use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use lead_finder::config::{self, Config};
use lead_finder::contact;
use lead_finder::docstore::SqliteDocumentStore;
use lead_finder::local::LocalStore;
use lead_finder::model::{LeadStatus, ReviewedEntry, DEFAULT_CATEGORY};
use lead_finder::panel::{self, EntryFilter};
use lead_finder::places::{PlacesClient, SearchQuery};
use lead_finder::reviewed::ReviewedStore;
use lead_finder::session::SearchSession;
use lead_finder::usage::{UsageCounter, UsageStatus};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search businesses of a kind in a city
    Search {
        /// Kind of business, e.g. "dentist"
        #[arg(long)]
        business: String,
        /// City to search in
        #[arg(long)]
        city: String,
        /// Number of result pages to load
        #[arg(long, default_value_t = 1)]
        pages: u32,
        /// Toggle these result ids in the reviewed list
        #[arg(long = "review")]
        review: Vec<String>,
        /// Category for businesses added with --review
        #[arg(long, default_value = DEFAULT_CATEGORY)]
        category: String,
    },
    /// Show this month's search usage
    Usage {
        /// Zero the counter for the current month
        #[arg(long)]
        reset: bool,
    },
    /// Manage reviewed businesses
    Reviewed {
        #[command(subcommand)]
        action: ReviewedAction,
    },
    /// Manage categories
    Categories {
        #[command(subcommand)]
        action: CategoryAction,
    },
    /// Print (or open) a WhatsApp link for a phone number
    Contact {
        phone: String,
        #[arg(long)]
        open: bool,
    },
    /// Print an example config file
    ExampleConfig,
}

#[derive(Debug, Subcommand)]
enum ReviewedAction {
    /// List reviewed businesses
    List {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        city: Option<String>,
        /// Match against name or address
        #[arg(long)]
        query: Option<String>,
    },
    /// Remove a business from the reviewed list
    Remove { id: String },
    /// Set the follow-up status (waiting, stopped, completed)
    Status { id: String, status: LeadStatus },
    /// Move a business to another category
    Category { id: String, category: String },
    /// Delete every reviewed business
    Clear {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum CategoryAction {
    List,
    Add { name: String },
    /// Remove a category; its businesses move to the default category
    Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }
    let cfg = config::load_optional(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let Some(cfg) = cfg else {
        // Contact links work without a config file, using the default message.
        if let Command::Contact { phone, open } = &args.command {
            return run_contact(None, phone, *open).await;
        }
        bail!("config file {} not found", args.config.display());
    };
    cfg.ensure_dirs()?;
    let local = LocalStore::open(cfg.local_storage_path());

    match args.command {
        Command::Search {
            business,
            city,
            pages,
            review,
            category,
        } => run_search(&cfg, local, &business, &city, pages, &review, &category).await,
        Command::Usage { reset } => run_usage(&cfg, local, reset),
        Command::Reviewed { action } => {
            let store = connect_reviewed(&cfg, local).await?;
            let result = run_reviewed(&store, action).await;
            store.shutdown();
            result
        }
        Command::Categories { action } => {
            let store = connect_reviewed(&cfg, local).await?;
            let result = run_categories(&store, action).await;
            store.shutdown();
            result
        }
        Command::Contact { phone, open } => {
            run_contact(cfg.contact.message.as_deref(), &phone, open).await
        }
        Command::ExampleConfig => Ok(()),
    }
}

async fn connect_reviewed(cfg: &Config, local: LocalStore) -> Result<ReviewedStore> {
    let docs = SqliteDocumentStore::connect(&cfg.database_url()).await?;
    let store = ReviewedStore::connect(Arc::new(docs), local).await?;
    store.ready().await?;
    Ok(store)
}

async fn run_search(
    cfg: &Config,
    local: LocalStore,
    business: &str,
    city: &str,
    pages: u32,
    review: &[String],
    category: &str,
) -> Result<()> {
    let places = PlacesClient::from_config(cfg)?;
    let counter = UsageCounter::new(local.clone(), cfg.usage);
    let mut session = SearchSession::new(Arc::new(places)).with_counter(counter.clone());

    let query = SearchQuery::new(business, city)?;
    session.search(query).await?;
    for _ in 1..pages.max(1) {
        if !session.has_more() {
            break;
        }
        session.load_more().await?;
    }

    let store = if review.is_empty() {
        None
    } else {
        Some(connect_reviewed(cfg, local).await?)
    };

    for business in session.results() {
        if let Some(store) = &store {
            if review.iter().any(|id| id == &business.id) {
                let outcome = store.toggle_with(business, category, Some(city)).await?;
                info!(id = %business.id, ?outcome, "toggled");
            }
        }
        let marker = match &store {
            Some(store) if store.is_reviewed(&business.id) => "[x]",
            _ => "[ ]",
        };
        println!("{} {}  {}", marker, business.id, business.name);
        println!("      {}", business.address);
        if let Some(phone) = &business.phone {
            let link = contact::contact_link_or_default(phone, cfg.contact.message.as_deref())
                .unwrap_or_default();
            println!("      {}  {}", phone, link);
        }
        if let Some(rating) = business.rating {
            println!("      rating {:.1} ({} reviews)", rating, business.rating_count);
        }
    }
    println!(
        "{} results{}",
        session.results().len(),
        if session.has_more() { ", more available" } else { "" }
    );

    let stats = counter.stats()?;
    println!(
        "searches this month: {} ({:.1}% of free tier)",
        stats.count, stats.percentage_of_free_tier
    );
    if let Some(store) = store {
        store.shutdown();
    }
    Ok(())
}

fn run_usage(cfg: &Config, local: LocalStore, reset: bool) -> Result<()> {
    let counter = UsageCounter::new(local, cfg.usage);
    if reset {
        counter.reset()?;
    }
    let stats = counter.stats()?;
    let limits = counter.limits();
    println!("searches this month: {}", stats.count);
    println!(
        "free tier: {:.1}% of {} ({} remaining)",
        stats.percentage_of_free_tier, limits.free_tier_limit, stats.free_tier_remaining
    );
    println!(
        "credit: {:.1}% of {} searches",
        stats.percentage_of_credit, limits.credit_limit
    );
    println!(
        "estimated cost: ${:.2}, remaining credit: ${:.2}",
        stats.estimated_cost, stats.remaining_credit
    );
    let note = match stats.status {
        UsageStatus::Safe => "within the free tier",
        UsageStatus::Warning => "past the free tier; spending credit",
        UsageStatus::Danger => "credit exhausted; searches are billed",
    };
    println!("status: {} ({})", stats.status, note);
    Ok(())
}

async fn run_reviewed(store: &ReviewedStore, action: ReviewedAction) -> Result<()> {
    match action {
        ReviewedAction::List {
            category,
            city,
            query,
        } => {
            let entries = store.entries();
            let filter = EntryFilter {
                category,
                city,
                query,
            };
            let shown = panel::filter_entries(&entries, &filter);
            for entry in &shown {
                print_entry(entry);
            }
            println!("{} of {} reviewed businesses", shown.len(), entries.len());
            let cities = panel::cities(&entries);
            if !cities.is_empty() {
                println!("cities: {}", cities.join(", "));
            }
        }
        ReviewedAction::Remove { id } => {
            if !store.remove(&id).await? {
                println!("{} was not in the reviewed list", id);
            }
        }
        ReviewedAction::Status { id, status } => {
            store.update_status(&id, status).await?;
            println!("{} -> {}", id, status.label());
        }
        ReviewedAction::Category { id, category } => {
            store.update_category(&id, &category).await?;
            println!("{} -> {}", id, category);
        }
        ReviewedAction::Clear { yes } => {
            let removed = store.clear_all(|count| yes || confirm(count)).await?;
            println!("removed {} reviewed businesses", removed);
        }
    }
    Ok(())
}

async fn run_categories(store: &ReviewedStore, action: CategoryAction) -> Result<()> {
    match action {
        CategoryAction::List => {
            let entries = store.entries();
            let counts = panel::count_by_category(&entries);
            for category in store.categories() {
                let count = counts.get(category.as_str()).copied().unwrap_or(0);
                println!("{} ({})", category, count);
            }
        }
        CategoryAction::Add { name } => {
            if !store.add_category(&name).await? {
                bail!("category '{}' is blank or already exists", name.trim());
            }
        }
        CategoryAction::Remove { name } => {
            if !store.remove_category(&name).await? {
                println!("nothing removed");
            }
        }
    }
    Ok(())
}

async fn run_contact(message: Option<&str>, phone: &str, open: bool) -> Result<()> {
    let Some(link) = contact::contact_link_or_default(phone, message) else {
        bail!("'{}' is not a usable phone number", phone);
    };
    println!("{}", link);
    if open {
        contact::open_link(Some(&link)).await?;
    }
    Ok(())
}

fn print_entry(entry: &ReviewedEntry) {
    println!(
        "{}  {}  [{}] {}",
        entry.id(),
        entry.business.name,
        entry.category,
        entry.status.label()
    );
    println!(
        "      {}{}",
        entry.business.address,
        entry
            .city
            .as_deref()
            .map(|c| format!(" ({})", c))
            .unwrap_or_default()
    );
    println!("      added {}", entry.created_at.format("%Y-%m-%d %H:%M"));
}

fn confirm(count: usize) -> bool {
    print!("Delete all {} reviewed businesses? [y/N] ", count);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
