use std::path::PathBuf;

use anyhow::Context;
use blood_ledger::{Actor, BloodBank, BloodGroup, Config, Movement};
use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about = "Administer a blood bank ledger")]
struct Cli {
    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the database path from the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show available units per blood group
    Balances,

    /// List ledger entries, newest first
    Ledger {
        /// Only show entries for this blood group, oldest first
        #[arg(long)]
        category: Option<BloodGroup>,

        /// Show at most this many entries
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Re-derive every balance from the ledger and check the digest chains
    Verify,

    /// Credit the configured initial stock if the ledger is empty
    Seed,

    /// Record a manual stock movement
    Adjust {
        /// IN or OUT
        movement: Movement,
        category: BloodGroup,
        quantity: u32,

        /// Administrator recording the movement
        #[arg(long, default_value = "admin")]
        admin: String,

        #[arg(long)]
        donor: Option<String>,

        #[arg(long)]
        patient: Option<String>,
    },

    /// Write the effective configuration to a file
    InitConfig {
        path: PathBuf,
    },
}

impl Cli {
    fn run(self) -> anyhow::Result<()> {
        setup_logging(self.verbose);

        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(db) = self.db {
            config.db_path = db;
        }

        let bank = match &self.command {
            Command::InitConfig { path } => {
                config.save(path)?;
                println!("wrote {}", path.display());
                return Ok(());
            }
            _ => BloodBank::open(&config)
                .with_context(|| format!("failed to open {}", config.db_path.display()))?,
        };

        match self.command {
            Command::Balances => {
                for (category, level) in bank.stock_levels() {
                    println!(
                        "{:<4} {:>6} (in {}, out {})",
                        category.as_str(),
                        level.available(),
                        level.credited,
                        level.debited
                    );
                }
            }
            Command::Ledger { category, limit } => {
                let entries = match category {
                    Some(category) => bank.entries_for(category).collect::<Result<Vec<_>, _>>()?,
                    None => bank.ledger_entries()?,
                };
                for entry in entries.iter().take(limit.unwrap_or(usize::MAX)) {
                    println!(
                        "#{:<6} {} {:<3} {:>4} {:<4} by {}{}{}",
                        entry.id,
                        entry.recorded_at.to_datetime_utc().format("%Y-%m-%d %H:%M:%S"),
                        entry.movement,
                        entry.quantity,
                        entry.category.as_str(),
                        entry.recorded_by,
                        entry
                            .donor
                            .as_ref()
                            .map(|donor| format!(" donor={donor}"))
                            .unwrap_or_default(),
                        entry
                            .patient
                            .as_ref()
                            .map(|patient| format!(" patient={patient}"))
                            .unwrap_or_default(),
                    );
                }
            }
            Command::Verify => {
                let levels = bank.verify_ledger()?;
                let units: i64 = levels.values().map(|level| level.available()).sum();
                println!("ledger intact, {units} units across {} groups", levels.len());
            }
            Command::Seed => {
                let written = bank.seed_if_empty(&Actor::system(), &config.initial_stock()?)?;
                println!("{} seed entries written", written.len());
            }
            Command::Adjust {
                movement,
                category,
                quantity,
                admin,
                donor,
                patient,
            } => {
                let entry = bank.adjust_stock(
                    &Actor::admin(admin),
                    movement,
                    category,
                    quantity,
                    donor,
                    patient,
                )?;
                println!(
                    "entry #{} recorded, {} now at {}",
                    entry.id,
                    category,
                    bank.balance_of(category)
                );
            }
            Command::InitConfig { .. } => {}
        }

        bank.flush()?;
        Ok(())
    }
}

fn setup_logging(verbosity: u8) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn main() -> anyhow::Result<()> {
    Cli::parse().run()
}
