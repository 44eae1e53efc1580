//! Command-line front end for ctxwarden.
//!
//! # Examples
//!
//! ```sh
//! # Compress a file with the content-aware compressor
//! ctxwarden compress notes.md --ratio 0.5
//!
//! # Use one base strategy and print the full result as JSON
//! ctxwarden compress build.log --strategy keyword-extraction --json
//!
//! # Fill a simulated window and run one policy step
//! ctxwarden simulate --items 200 --total-tokens 20000
//!
//! # Validate a configuration file
//! ctxwarden check-config warden.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ctxwarden::compression::detect_content;
use ctxwarden::logging::{LogFormat, init_logging};
use ctxwarden::prelude::*;

#[derive(Parser)]
#[command(name = "ctxwarden", version, about = "Token-budgeted context window management")]
struct Cli {
    // ── Logging ──
    /// Log output format: compact or json.
    #[arg(long, default_value = "compact", global = true)]
    log_format: LogFormat,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compress a file (or stdin with `-`).
    Compress {
        input: PathBuf,
        /// Target ratio of compressed to original tokens.
        #[arg(long, default_value_t = 0.6)]
        ratio: f64,
        /// A base strategy name; content-aware compression when omitted.
        #[arg(long)]
        strategy: Option<CompressionStrategy>,
        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Report the detected content category of a file (or stdin).
    Detect { input: PathBuf },
    /// Fill a simulated window and run one auto-compression step.
    Simulate {
        /// Configuration file; defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of synthetic items to add.
        #[arg(long, default_value_t = 100)]
        items: usize,
        /// Override the window's total token budget.
        #[arg(long)]
        total_tokens: Option<usize>,
    },
    /// Print the configuration JSON Schema.
    Schema,
    /// Validate a configuration file.
    CheckConfig { path: PathBuf },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, &cli.log_level);

    let outcome = match cli.command {
        Command::Compress {
            input,
            ratio,
            strategy,
            json,
        } => compress(&input, ratio, strategy, json),
        Command::Detect { input } => read_input(&input).map(|text| {
            let detection = detect_content(&text);
            println!("{} (confidence {:.2})", detection.category, detection.confidence);
        }),
        Command::Simulate {
            config,
            items,
            total_tokens,
        } => simulate(config.as_deref(), items, total_tokens).await,
        Command::Schema => serde_json::to_string_pretty(&WardenConfig::json_schema())
            .map(|s| println!("{s}"))
            .map_err(|e| e.to_string()),
        Command::CheckConfig { path } => WardenConfig::load(&path)
            .map(|_| println!("{}: ok", path.display()))
            .map_err(|e| e.to_string()),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn read_input(path: &Path) -> Result<String, String> {
    if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).map_err(|e| format!("reading stdin: {e}"))
    } else {
        std::fs::read_to_string(path).map_err(|e| format!("reading {}: {e}", path.display()))
    }
}

fn compress(
    input: &Path,
    ratio: f64,
    strategy: Option<CompressionStrategy>,
    json: bool,
) -> Result<(), String> {
    let text = read_input(input)?;
    let result = match strategy {
        Some(strategy) => strategy.compress(&text, ratio),
        None => match EnhancedCompressor::new().compress(&text, ratio) {
            Ok(done) => done.result,
            Err(e) => {
                tracing::warn!("content-aware compression failed ({e}), echoing input");
                CompressionResult::unchanged(&text, "enhanced")
            }
        },
    };

    if json {
        let out = serde_json::to_string_pretty(&result).map_err(|e| e.to_string())?;
        println!("{out}");
    } else {
        println!("{}", result.compressed);
        eprintln!(
            "{}: {} -> {} tokens (ratio {:.2}, loss {:.2})",
            result.strategy,
            result.original_tokens,
            result.compressed_tokens,
            result.compression_ratio,
            result.information_loss
        );
    }
    Ok(())
}

async fn simulate(
    config_path: Option<&Path>,
    items: usize,
    total_tokens: Option<usize>,
) -> Result<(), String> {
    let mut config = match config_path {
        Some(path) => WardenConfig::load(path).map_err(|e| e.to_string())?,
        None => WardenConfig::default(),
    };
    if let Some(total) = total_tokens {
        config = config.with_total_tokens(total);
    }

    let mut window = ContextWindowManager::new("sim", &config).map_err(|e| e.to_string())?;
    let mut rejected = 0;
    for i in 0..items {
        if !window.add(synthetic_item(i)) {
            rejected += 1;
        }
    }
    let shared = window.into_shared();

    let events = Arc::new(EventBus::new());
    events.add_handler(LoggingHandler);
    let auto =
        AutoCompressionManager::with_parts(&config, Arc::new(EnhancedCompressor::new()), Arc::clone(&events))
            .map_err(|e| e.to_string())?;
    let monitor = TokenMonitor::with_events(&config, events).map_err(|e| e.to_string())?;
    auto.register("sim", Arc::clone(&shared));
    monitor.register("sim", Arc::clone(&shared));

    monitor.poll().await;
    let report = auto.check_and_compress().await;
    monitor.poll().await;

    println!("Added {} items ({rejected} rejected)", items - rejected);
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?
    );
    print!("{}", monitor.report());
    let stats = shared.lock().await.get_allocation_stats();
    println!(
        "Allocation efficiency: {:.2} ({} / {} tokens)",
        stats.efficiency_score, stats.total_used, stats.total_allocated
    );
    Ok(())
}

fn synthetic_item(i: usize) -> ContextItem {
    let (kind, content) = match i % 4 {
        0 => (
            ContentType::Conversation,
            format!(
                "User asked about step {i} of the migration. The assistant explained that the \
                 schema change must land before the backfill. They agreed to run the backfill \
                 in batches of one thousand rows and to watch replication lag closely."
            ),
        ),
        1 => (
            ContentType::Code,
            format!(
                "// handler {i}\nfn handle_{i}(req: Request) -> Result<Response> {{\n    \
                 let user = load_user(req.user_id)?;\n    // check permissions\n    \
                 authorize(&user, Action::Read)?;\n\n    Ok(Response::ok(user))\n}}\n"
            ),
        ),
        2 => (
            ContentType::Error,
            format!("2024-05-01 10:00:{:02} ERROR request {i} failed: connection reset\n", i % 60),
        ),
        _ => (
            ContentType::ProjectState,
            format!("Milestone {i}: storage layer refactor, tests passing, docs pending."),
        ),
    };
    let priority = match i % 7 {
        0 => Priority::High,
        5 => Priority::Low,
        _ => Priority::Medium,
    };
    ContextItem::new(format!("item-{i}"), content, kind).with_priority(priority)
}
