//! noema-inspect: Print what a GGUF model file declares about itself.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use serde::Serialize;

use noema_core::gguf::{inspect_file, moe_info, MoeInfo};
use noema_core::types::model::{Capability, ModelSummary};

#[derive(Parser)]
#[command(name = "noema-inspect", about = "Inspect GGUF model metadata")]
struct Args {
    /// Path to a .gguf file
    path: PathBuf,

    /// Also scan for Mixture-of-Experts structure
    #[arg(long)]
    moe: bool,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Disable logging
    #[arg(long)]
    log_disable: bool,
}

#[derive(Serialize)]
struct Report {
    #[serde(flatten)]
    summary: ModelSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    moe: Option<MoeInfo>,
}

fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let summary = inspect_file(&args.path)?;
    let moe = if args.moe { moe_info(&args.path) } else { None };
    let report = Report { summary, moe };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }
    Ok(())
}

fn capability(c: Capability) -> &'static str {
    match c {
        Capability::Present => "yes",
        Capability::Absent => "no",
        Capability::Unknown => "unknown",
    }
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn print_text(report: &Report) {
    let s = &report.summary;
    println!("{:<18} {}", "Name", s.display_name());
    println!(
        "{:<18} {}",
        "Architecture",
        or_dash(s.architecture.as_ref().map(|a| a.architecture.clone()))
    );
    println!("{:<18} {:.2} GB", "Size", s.file_size as f64 / 1e9);
    println!("{:<18} {}", "Layers", or_dash(s.layer_count));
    println!("{:<18} {}", "Context length", or_dash(s.context_length));
    println!(
        "{:<18} {}",
        "Chat template",
        if s.chat_template.is_some() { "yes" } else { "no" }
    );
    println!("{:<18} {}", "Tool calling", capability(s.capabilities.tool_calling));
    println!("{:<18} {}", "Vision hint", capability(s.capabilities.vision_hint));
    println!(
        "{:<18} {}",
        "Vision projector",
        capability(s.capabilities.vision_projector)
    );

    if let Some(moe) = &report.moe {
        println!();
        println!("{:<18} {}", "MoE", if moe.is_moe { "yes" } else { "no" });
        println!("{:<18} {}", "Experts", moe.expert_count);
        println!("{:<18} {}", "Experts used", or_dash(moe.default_used));
        println!("{:<18} {}", "MoE layers", or_dash(moe.moe_layer_count));
        println!("{:<18} {}", "Total layers", or_dash(moe.total_layer_count));
        println!("{:<18} {}", "Hidden size", or_dash(moe.hidden_size));
        println!("{:<18} {}", "FFN size", or_dash(moe.feed_forward_size));
        println!("{:<18} {}", "Vocab size", or_dash(moe.vocab_size));
    }
}
