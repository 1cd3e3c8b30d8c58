use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;

use estimate_provenance::{
    import, init_logging, EngineConfig, EstimatingEngine, FormulaDraft, InputDecl, LogFormat,
    RoundingMode, RoundingRule, SqliteStore, ValueKind, ValueSource, VatBase,
};

#[derive(Parser)]
#[command(name = "estimate-provenance", version, about = "Versioned estimating formulas with computation provenance")]
struct Cli {
    /// JSON config file (optional)
    #[arg(long, global = true, default_value = "estimate.json")]
    config: PathBuf,

    /// Database path (overrides config and ESTIMATE_DATABASE)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and seed configured organization pricing
    Init,

    /// Show or update an organization's pricing policy
    Policy {
        organization: String,
        #[arg(long)]
        markup: Option<Decimal>,
        #[arg(long)]
        vat: Option<Decimal>,
        /// subtotal | subtotal_plus_markup
        #[arg(long)]
        vat_base: Option<VatBase>,
        #[arg(long)]
        places: Option<u32>,
        /// half_up | half_even
        #[arg(long)]
        rounding: Option<RoundingMode>,
    },

    /// Create an estimate using the organization's current policy
    CreateEstimate {
        #[arg(long)]
        organization: String,
        #[arg(long)]
        name: String,
    },

    /// Import line items from CSV into an estimate
    Import { estimate_id: String, csv: PathBuf },

    /// Publish a new formula version
    Publish {
        #[arg(long)]
        key: String,
        /// Formula body; use --body-file for multi-line bodies
        #[arg(long, conflicts_with = "body_file")]
        body: Option<String>,
        #[arg(long)]
        body_file: Option<PathBuf>,
        /// name:number or name:boolean, repeatable
        #[arg(long = "input", value_parser = parse_input_decl)]
        inputs: Vec<InputDecl>,
        /// Output name, repeatable; the first one is the line total by default
        #[arg(long = "output", required = true)]
        outputs: Vec<String>,
        #[arg(long)]
        author: String,
    },

    /// Published formula keys with their current version
    Formulas,

    /// List every version of a formula
    History { key: String },

    /// Compute one line item against the current formula version
    Compute {
        line_item_id: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Recompute every formula-driven line item of an estimate
    Recompute {
        estimate_id: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Subtotal, markup, VAT and grand total
    Totals { estimate_id: String },

    /// Staleness of every formula-driven line item of an estimate
    Staleness { estimate_id: String },

    /// Snapshot history of a line item
    Snapshots { line_item_id: String },

    /// Replay a line item's latest snapshot
    Verify { line_item_id: String },

    /// Formula versions used by an estimate
    Usage { estimate_id: String },

    /// Audit trail of a line item
    Events { line_item_id: String },
}

fn parse_input_decl(raw: &str) -> std::result::Result<InputDecl, String> {
    let (name, kind) = raw.split_once(':').unwrap_or((raw, "number"));
    let kind: ValueKind = kind.parse()?;
    Ok(InputDecl {
        name: name.to_string(),
        kind,
    })
}

fn explain(e: estimate_provenance::Error) -> anyhow::Error {
    let message = e.user_message();
    anyhow::Error::new(e).context(message)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load(&cli.config)?;
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }

    let mut logging = config.logging.clone().with_verbosity(cli.verbose);
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    init_logging(&logging)?;

    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?;
    let engine = EstimatingEngine::with_sqlite(Arc::new(store))
        .with_default_pricing(config.default_pricing.clone());

    run(cli.command, &config, &engine)
}

fn run(command: Command, config: &EngineConfig, engine: &EstimatingEngine) -> Result<()> {
    match command {
        Command::Init => {
            let seeded = config.seed_organizations(engine)?;
            println!("🗄️  Database ready: {:?}", config.database_path);
            println!("✓ Seeded pricing for {} organization(s)", seeded);
        }

        Command::Policy {
            organization,
            markup,
            vat,
            vat_base,
            places,
            rounding,
        } => {
            let mut policy = engine.organization_pricing(&organization).map_err(explain)?;
            let changed = markup.is_some() || vat.is_some() || vat_base.is_some() || places.is_some() || rounding.is_some();

            if let Some(markup) = markup {
                policy.markup_percent = markup;
            }
            if let Some(vat) = vat {
                policy.vat_percent = vat;
            }
            if let Some(vat_base) = vat_base {
                policy.vat_base = vat_base;
            }
            if places.is_some() || rounding.is_some() {
                policy.rounding = RoundingRule {
                    places: places.unwrap_or(policy.rounding.places),
                    mode: rounding.unwrap_or(policy.rounding.mode),
                };
            }

            if changed {
                if let Err(reason) = policy.validate() {
                    bail!("Invalid policy: {}", reason);
                }
                engine.set_organization_pricing(&organization, &policy).map_err(explain)?;
                println!("✓ Updated pricing for {}", organization);
            }
            println!("{}", serde_json::to_string_pretty(&policy)?);
        }

        Command::CreateEstimate { organization, name } => {
            let estimate = engine.create_estimate(&organization, &name).map_err(explain)?;
            println!("✓ Created estimate '{}'", estimate.name);
            println!("  id: {}", estimate.id);
            println!(
                "  markup {}%, VAT {}% on {}",
                estimate.pricing.markup_percent, estimate.pricing.vat_percent, estimate.pricing.vat_base
            );
        }

        Command::Import { estimate_id, csv } => {
            println!("📂 Loading CSV...");
            let items = import::load_csv(&csv, &estimate_id)?;
            for item in &items {
                engine.save_line_item(item).map_err(explain)?;
                println!("  {:>3}  {}  {}", item.position, item.id, item.description);
            }
            println!("✓ Imported {} line items", items.len());
        }

        Command::Publish {
            key,
            body,
            body_file,
            inputs,
            outputs,
            author,
        } => {
            let body = match (body, body_file) {
                (Some(body), _) => body,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read formula body: {:?}", path))?,
                (None, None) => bail!("Provide --body or --body-file"),
            };

            let mut draft = FormulaDraft::new(key, body, author);
            for input in inputs {
                draft = draft.with_input(input);
            }
            for output in outputs {
                draft = draft.with_output(output);
            }

            let version = engine.publish_formula_version(draft).map_err(explain)?;
            println!("✓ Published {}", version.reference());
        }

        Command::Formulas => {
            for (key, sequence) in engine.formula_catalog().map_err(explain)? {
                println!("  {:<30} v{}", key, sequence);
            }
        }

        Command::History { key } => {
            let history = engine.formula_history(&key).map_err(explain)?;
            for version in history {
                println!(
                    "v{}  {}  {}",
                    version.sequence(),
                    version.created_at().to_rfc3339(),
                    version.author()
                );
                for line in version.body_source().lines() {
                    println!("      {}", line);
                }
            }
        }

        Command::Compute { line_item_id, by } => {
            let snapshot = engine.compute_line_item(&line_item_id, &by).map_err(explain)?;
            println!("✓ Computed with {}", snapshot.version_ref());
            for (name, value) in snapshot.outputs() {
                println!("  {} = {}", name, value);
            }
        }

        Command::Recompute { estimate_id, by } => {
            let run = engine.recompute_estimate(&estimate_id, &by).map_err(explain)?;
            println!("✓ Recomputed {} line item(s)", run.snapshots.len());
            for failure in &run.failures {
                let hint = if failure.evaluation { "  (edit the formula or inputs)" } else { "" };
                println!("❌ {} [{}] {}{}", failure.line_item_id, failure.kind, failure.message, hint);
            }
            if !run.is_complete() {
                bail!("{} line item(s) failed", run.failures.len());
            }
        }

        Command::Totals { estimate_id } => {
            let totals = engine.aggregate_totals(&estimate_id).map_err(explain)?;
            for line in &totals.lines {
                let source = match &line.source {
                    ValueSource::Snapshot { formula, .. } => formula.to_string(),
                    ValueSource::Manual => "manual".to_string(),
                    ValueSource::Pending => "not computed".to_string(),
                    ValueSource::Unpriced => "no value".to_string(),
                };
                println!("  {:>3}  {:<30} {:>14}  ({})", line.position, line.description, line.amount, source);
            }
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("  Subtotal      {:>14}", totals.subtotal);
            println!("  Markup        {:>14}  ({}%)", totals.markup_amount, totals.policy.markup_percent);
            println!(
                "  VAT           {:>14}  ({}% on {})",
                totals.vat_amount, totals.policy.vat_percent, totals.policy.vat_base
            );
            println!("  Grand total   {:>14}", totals.grand_total);
            if !totals.pending.is_empty() {
                println!("⚠️  {} formula line item(s) not computed yet", totals.pending.len());
            }
        }

        Command::Staleness { estimate_id } => {
            for item in engine.line_items(&estimate_id).map_err(explain)? {
                if !item.is_formula_driven() {
                    continue;
                }
                match engine.staleness(&item.id) {
                    Ok(status) if status.formula_changed() => println!(
                        "  {:>3}  {:<30} {} v{} -> {} v{}  {}",
                        item.position,
                        item.description,
                        status.snapshot_formula_key,
                        status.snapshot_sequence,
                        status.formula_key,
                        status.current_sequence,
                        status.label()
                    ),
                    Ok(status) => println!(
                        "  {:>3}  {:<30} v{} / v{}  {}",
                        item.position,
                        item.description,
                        status.snapshot_sequence,
                        status.current_sequence,
                        status.label()
                    ),
                    Err(e) => println!("  {:>3}  {:<30} {}", item.position, item.description, e.user_message()),
                }
            }
        }

        Command::Snapshots { line_item_id } => {
            for snapshot in engine.snapshot_history(&line_item_id).map_err(explain)? {
                let total = snapshot
                    .line_total()
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                println!(
                    "{}  {}  {:>14}  by {}",
                    snapshot.computed_at().to_rfc3339(),
                    snapshot.version_ref(),
                    total,
                    snapshot.triggered_by()
                );
            }
        }

        Command::Verify { line_item_id } => {
            let verification = engine.verify_snapshot(&line_item_id).map_err(explain)?;
            println!("🔍 Snapshot {} ({})", verification.snapshot_id, verification.formula);
            println!("  digest:  {}", if verification.digest_valid { "✓ valid" } else { "❌ mismatch" });
            println!(
                "  outputs: {}",
                if verification.outputs_reproduced { "✓ reproduced" } else { "❌ differ" }
            );
            if let Some(error) = &verification.replay_error {
                println!("  replay:  ❌ {}", error);
            }
            if !verification.is_valid() {
                bail!("Snapshot failed verification");
            }
        }

        Command::Usage { estimate_id } => {
            for usage in engine.formula_usage(&estimate_id).map_err(explain)? {
                let sequences: Vec<String> = usage.sequences.iter().map(|s| format!("v{}", s)).collect();
                let current = usage
                    .current_sequence
                    .map(|s| format!("v{}", s))
                    .unwrap_or_else(|| "missing".to_string());
                println!(
                    "{}  current {}  used {}  ({} line items, {} stale, {} not computed)",
                    usage.formula_key,
                    current,
                    sequences.join(", "),
                    usage.line_items,
                    usage.stale,
                    usage.pending
                );
            }
        }

        Command::Events { line_item_id } => {
            for event in engine.line_item_events(&line_item_id).map_err(explain)? {
                println!(
                    "{}  {:<18} by {}  {}",
                    event.timestamp.to_rfc3339(),
                    event.event_type,
                    event.actor,
                    event.data
                );
            }
        }
    }

    Ok(())
}
