//! Life timeline command line driver.
//!
//! Reads a narrative from a file or stdin and prints the resulting timeline
//! as JSON commit descriptors.
//!
//! ```bash
//! echo "In 2020 I moved out. In 2024 I started therapy." | cargo run -p lifeline -- --offline
//! ```

mod args;

use std::io::Read;

use lifeline_core::{
    CandidateEvent, CancelToken, RunReport, SynthesisConfig, Synthesizer, TemporalAnchor,
    TimelineRequest,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use args::{parse_config_from_args, CliConfig};

#[tokio::main]
async fn main() {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LIFELINE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_config_from_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };

    if cli.help {
        print_help();
        return;
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    let request = build_request(&cli)?;

    let mut config = SynthesisConfig::from_env();
    if cli.merge_branches {
        config = config.with_merge_branches(true);
    }
    if let Some(dir) = &cli.cache_dir {
        config = config.with_cache_dir(dir);
    }
    if cli.no_cache {
        config = config.without_cache();
    }

    let synthesizer = if cli.offline {
        Synthesizer::new(config).await
    } else {
        Synthesizer::from_env(config).await
    };

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            on_interrupt.cancel();
        }
    });

    let report = synthesizer.synthesize_with_cancel(request, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&render(&report))?);
    Ok(())
}

fn build_request(cli: &CliConfig) -> Result<TimelineRequest, Box<dyn std::error::Error>> {
    let text = match &cli.input {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?,
        None if cli.candidates.is_some() => String::new(),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            text
        }
    };

    let candidates: Vec<CandidateEvent> = match &cli.candidates {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str(&content)
                .map_err(|e| format!("invalid events in {}: {e}", path.display()))?
        }
        None => Vec::new(),
    };

    let mut request = TimelineRequest::new(text).with_candidates(candidates);
    if cli.birth_date.is_some() || cli.reference_date.is_some() {
        request = request.with_anchor(TemporalAnchor {
            birth_date: cli.birth_date,
            reference_date: cli.reference_date,
        });
    }
    Ok(request)
}

fn render(report: &RunReport) -> serde_json::Value {
    let branches: Vec<_> = report
        .timeline
        .branches()
        .iter()
        .map(|b| {
            serde_json::json!({
                "name": b.name,
                "root": b.root,
                "commits": b.commits.len(),
                "merged": b.merged_at.is_some(),
            })
        })
        .collect();

    serde_json::json!({
        "input_hash": report.input_hash,
        "cache_hit": report.cache_hit,
        "commits": report.commit_descriptors(),
        "branches": branches,
        "diagnostics": report.diagnostics,
    })
}

fn print_help() {
    println!("lifeline - turn a life narrative into a branching timeline");
    println!();
    println!("USAGE:");
    println!("  lifeline [OPTIONS] < story.txt");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help                Show this help message");
    println!("  --input <FILE>            Read the narrative from FILE instead of stdin");
    println!("  --candidates <FILE>       JSON array of pre-extracted events");
    println!("  --birth-date <YYYY-MM-DD> Anchor for ages (\"when I was 18\")");
    println!("  --reference-date <DATE>   Anchor for \"last year\", \"two years ago\"");
    println!("  --merge-branches          Merge each branch back into main");
    println!("  --cache-dir <DIR>         Persist results under DIR");
    println!("  --no-cache                Always run the full pipeline");
    println!("  --offline                 Use local heuristics even if an API key is set");
    println!();
    println!("ENVIRONMENT:");
    println!("  ANTHROPIC_API_KEY         Enables model-backed agents");
    println!("  LIFELINE_MODEL            Model override");
    println!("  LIFELINE_CACHE_DIR        Same as --cache-dir");
    println!("  LIFELINE_MAX_CONCURRENCY  Concurrent model calls (default 4)");
    println!("  LIFELINE_MERGE_BRANCHES   Same as --merge-branches");
    println!("  LIFELINE_LOG              Log filter, e.g. lifeline_core=debug (default warn)");
}
