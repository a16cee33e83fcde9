use bolus_core::csv_rollup::{cleanup_processed_wals, entries_to_csv_and_archive};
use bolus_core::*;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bolus")]
#[command(about = "Insulin bolus calculator with safety gating", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use a specific config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Calculate a suggested bolus and optionally record it
    Calc {
        /// Current glucose reading
        #[arg(long, allow_hyphen_values = true)]
        glucose: f64,

        /// Carbohydrates to cover, in grams
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        carbs: f64,

        /// Glucose trend (rising, stable, falling)
        #[arg(long, default_value = "stable")]
        trend: GlucoseTrend,

        /// Acknowledge a dose capped at the maximum bolus
        #[arg(long)]
        ack: bool,

        /// Confirm recording without prompting
        #[arg(long)]
        confirm: bool,

        /// Dry run - show the calculation without recording
        #[arg(long)]
        dry_run: bool,
    },

    /// Show current insulin on board
    Iob,

    /// Manually log an insulin dose
    Log {
        /// Units administered
        #[arg(long)]
        units: f64,

        /// Insulin type (rapid, basal)
        #[arg(long = "type", default_value = "rapid")]
        insulin_type: InsulinType,

        /// When the dose was taken, in minutes before now
        #[arg(long, default_value_t = 0)]
        minutes_ago: i64,
    },

    /// List recent insulin entries
    History {
        /// How far back to look
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Show or edit the dosing profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Roll up WAL entries to CSV
    Rollup {
        /// Clean up processed WAL files after rollup
        #[arg(long)]
        cleanup: bool,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Show the stored and resolved profile
    Show,

    /// Set one or more profile fields
    Set {
        #[arg(long)]
        icr: Option<f64>,
        #[arg(long)]
        isf: Option<f64>,
        #[arg(long)]
        target_low: Option<f64>,
        #[arg(long)]
        target_high: Option<f64>,
        #[arg(long)]
        max_bolus: Option<f64>,
        #[arg(long)]
        active_insulin_hours: Option<f64>,
    },
}

fn main() {
    // Initialize logging
    bolus_core::logging::init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        if let Error::ProfileNotFound(_) = e {
            eprintln!("Create one with `bolus profile set`.");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());
    tracing::debug!("Using data directory {:?}", data_dir);

    match cli.command {
        Commands::Calc {
            glucose,
            carbs,
            trend,
            ack,
            confirm,
            dry_run,
        } => cmd_calc(
            data_dir,
            &config,
            DoseRequest::new(glucose, carbs, trend),
            ack,
            confirm,
            dry_run,
        ),
        Commands::Iob => cmd_iob(data_dir, &config),
        Commands::Log {
            units,
            insulin_type,
            minutes_ago,
        } => cmd_log(data_dir, units, insulin_type, minutes_ago),
        Commands::History { hours } => cmd_history(data_dir, hours),
        Commands::Profile { action } => cmd_profile(data_dir, &config, action),
        Commands::Rollup { cleanup } => cmd_rollup(data_dir, cleanup),
    }
}

fn cmd_calc(
    data_dir: PathBuf,
    config: &Config,
    request: DoseRequest,
    ack: bool,
    confirm: bool,
    dry_run: bool,
) -> Result<()> {
    let policy = &config.policy;
    let mut store = JsonlEntryStore::in_data_dir(&data_dir);
    let profiles = FileProfileStore::in_data_dir(&data_dir);

    let snapshot = DoseSnapshot::load(&store, &profiles, &config.user.id, policy, Utc::now())?;
    let mut gate = evaluate(&snapshot, &request, policy)?;

    let result = match gate.state() {
        GateState::HypoBlocked(advisory) => {
            display_hypo_advisory(advisory);
            return Ok(());
        }
        state => match state.result() {
            Some(result) => result.clone(),
            None => return Err(Error::Other(format!("unexpected gate state {}", state.name()))),
        },
    };

    display_result(&request, &result, &snapshot.profile, policy);

    if dry_run {
        println!("\n[Dry run - not recording dose]");
        return Ok(());
    }

    if !has_dose(&result) {
        println!("\nNo insulin needed - nothing to record.");
        return Ok(());
    }

    let ack = if matches!(gate.state(), GateState::AboveMaxPendingAck(_)) && !ack {
        println!(
            "\n⚠ Calculated dose {} exceeds your maximum of {} units.",
            result.raw_suggested_dose, snapshot.profile.max_bolus
        );
        prompt_yes(&format!(
            "Type 'yes' to acknowledge the capped dose of {} units",
            result.final_dose
        ))?
    } else {
        ack
    };

    let needs_prompt =
        policy.require_two_step_confirm_for_recording && !confirm && gate.is_recordable(ack, true);
    let confirm = if needs_prompt {
        prompt_yes(&format!(
            "Record {} units of rapid insulin? Type 'yes' to confirm",
            result.final_dose
        ))?
    } else {
        confirm
    };

    match gate.record(ack, confirm, &mut store, Utc::now())? {
        ConfirmOutcome::Recorded(entry) => {
            println!("\n✓ Recorded {} units", entry.units);
            println!("  Entry: {}", entry.id);
        }
        ConfirmOutcome::Rejected(reason) => {
            println!("\nNot recorded: {}", reason);
            match reason {
                RejectReason::AckRequired => {
                    println!("  Re-run with --ack to acknowledge the capped dose.")
                }
                RejectReason::ConfirmationRequired => {
                    println!("  Re-run with --confirm once you have taken the dose.")
                }
                RejectReason::HypoBlocked
                | RejectReason::NothingToRecord
                | RejectReason::ZeroDose => {}
            }
        }
    }

    Ok(())
}

fn cmd_iob(data_dir: PathBuf, config: &Config) -> Result<()> {
    let store = JsonlEntryStore::in_data_dir(&data_dir);
    let profiles = FileProfileStore::in_data_dir(&data_dir);

    let snapshot = DoseSnapshot::load(
        &store,
        &profiles,
        &config.user.id,
        &config.policy,
        Utc::now(),
    )?;
    let rapid_count = snapshot.entries.iter().filter(|e| e.is_rapid()).count();

    println!("Insulin on board: {:.1} units", snapshot.iob());
    println!(
        "  From {} rapid entries in the last {} hours",
        rapid_count, snapshot.profile.active_insulin_hours
    );
    Ok(())
}

fn cmd_log(data_dir: PathBuf, units: f64, insulin_type: InsulinType, minutes_ago: i64) -> Result<()> {
    if !(units.is_finite() && units > 0.0) {
        return Err(Error::validation("units", "must be a positive number"));
    }
    if minutes_ago < 0 {
        return Err(Error::validation("minutes-ago", "must not be negative"));
    }

    let entry = InsulinEntry {
        id: uuid::Uuid::new_v4(),
        timestamp: Utc::now() - Duration::minutes(minutes_ago),
        units,
        insulin_type,
        source: EntrySource::Manual,
    };

    let mut store = JsonlEntryStore::in_data_dir(&data_dir);
    store.append_insulin_entry(&entry)?;

    println!("✓ Logged {} units of {} insulin", entry.units, entry.insulin_type);
    Ok(())
}

fn cmd_history(data_dir: PathBuf, hours: i64) -> Result<()> {
    let store = JsonlEntryStore::in_data_dir(&data_dir);
    let entries = store.list_insulin_entries(Utc::now() - Duration::hours(hours))?;

    if entries.is_empty() {
        println!("No insulin entries in the last {} hours.", hours);
        return Ok(());
    }

    for entry in &entries {
        println!(
            "  {}  {:>6.2} u  {:<5}  {:?}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.units,
            entry.insulin_type,
            entry.source
        );
    }
    println!("{} entries in the last {} hours", entries.len(), hours);
    Ok(())
}

fn cmd_profile(data_dir: PathBuf, config: &Config, action: ProfileAction) -> Result<()> {
    let profiles = FileProfileStore::in_data_dir(&data_dir);
    let user_id = &config.user.id;

    match action {
        ProfileAction::Show => {
            let stored = profiles.get_dosing_profile(user_id)?;
            let resolved = stored.resolve_checked(&config.policy)?;
            display_profile(user_id, &stored, &resolved);
        }
        ProfileAction::Set {
            icr,
            isf,
            target_low,
            target_high,
            max_bolus,
            active_insulin_hours,
        } => {
            let changes = StoredDosingProfile {
                icr,
                isf,
                target_low,
                target_high,
                max_bolus,
                active_insulin_hours,
            };

            let updated = profiles.update(user_id, |current| {
                let merged = current.merged_with(&changes);
                merged.resolve_checked(&config.policy)?;
                *current = merged;
                Ok(())
            })?;
            let resolved = updated.resolve_checked(&config.policy)?;

            println!("✓ Profile saved");
            display_profile(user_id, &updated, &resolved);
        }
    }

    Ok(())
}

fn cmd_rollup(data_dir: PathBuf, cleanup: bool) -> Result<()> {
    let store = JsonlEntryStore::in_data_dir(&data_dir);

    if !store.wal_path().exists() {
        println!("No WAL file found - nothing to roll up.");
        return Ok(());
    }

    let count = entries_to_csv_and_archive(store.wal_path(), store.csv_path())?;

    println!("✓ Rolled up {} entries to CSV", count);
    println!("  CSV: {}", store.csv_path().display());

    if cleanup {
        let wal_dir = data_dir.join("wal");
        let cleaned = cleanup_processed_wals(&wal_dir)?;
        if cleaned > 0 {
            println!("✓ Cleaned up {} processed WAL files", cleaned);
        }
    }

    Ok(())
}

fn display_hypo_advisory(advisory: &HypoAdvisory) {
    println!("\n╭─────────────────────────────────────────╮");
    println!("│  LOW GLUCOSE - DO NOT TAKE INSULIN");
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!("  {}", advisory.message());
    println!();
    println!("  No dose was calculated.");
}

fn display_result(
    request: &DoseRequest,
    result: &DoseCalculationResult,
    profile: &UserDosingProfile,
    policy: &PolicyConfig,
) {
    println!("\n╭─────────────────────────────────────────╮");
    println!("│  SUGGESTED BOLUS: {} units", result.final_dose);
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!(
        "  Glucose:     {} ({:?}, {})",
        request.glucose,
        classify_glucose(request.glucose, profile, policy),
        request.trend
    );
    println!("  Meal:        {:>6.2} u  ({} g / {})", result.meal_bolus, request.carbs, profile.icr);
    println!("  Correction:  {:>6.2} u", result.correction_bolus);
    if request.trend == GlucoseTrend::Falling {
        println!(
            "               (scaled by {} while falling)",
            policy.trend_down_correction_multiplier
        );
    }
    println!("  On board:    {:>6.1} u", result.iob);
    println!("  Calculated:  {:>6.2} u", result.raw_suggested_dose);
    if result.is_above_max {
        println!(
            "  Capped at your maximum bolus of {} units (calculated {} before capping).",
            profile.max_bolus, result.raw_suggested_dose
        );
    }
    if classify_glucose(request.glucose, profile, policy) == GlucoseBand::High {
        println!();
        println!("  ℹ Glucose is above {}. Consider checking ketones.", policy.hyper_threshold);
    }
}

fn display_profile(user_id: &str, stored: &StoredDosingProfile, resolved: &UserDosingProfile) {
    fn source(value: Option<f64>) -> &'static str {
        if value.is_some() {
            ""
        } else {
            " (default)"
        }
    }

    println!("\nProfile: {}", user_id);
    println!("  ICR:                  {}{}", resolved.icr, source(stored.icr));
    println!("  ISF:                  {}{}", resolved.isf, source(stored.isf));
    println!("  Target low:           {}{}", resolved.target_low, source(stored.target_low));
    println!("  Target high:          {}{}", resolved.target_high, source(stored.target_high));
    println!("  Max bolus:            {}{}", resolved.max_bolus, source(stored.max_bolus));
    println!(
        "  Active insulin hours: {}{}",
        resolved.active_insulin_hours,
        source(stored.active_insulin_hours)
    );
}

fn prompt_yes(question: &str) -> Result<bool> {
    println!("─────────────────────────────────────────");
    print!("{} > ", question);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(matches!(input.trim().to_lowercase().as_str(), "yes" | "y"))
}
