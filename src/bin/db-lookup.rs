// SPDX-License-Identifier: Apache-2.0

//! Queries the transform table of a catalogue database.
//!
//! A numeric argument (decimal, hex or octal) shows the transform with
//! that id; a lowercase name resolves through the forward name index.
//! Short names are padded with the identity tail, so `ba` means "swap
//! the first two slots".

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use microfractal::db::Database;
use microfractal::transform::{name_of, perm_from_name};
use microfractal::MAXSLOTS;

/// Look up transforms by id or name.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Catalogue database.
    #[arg(short = 'D', long, default_value = "catalogue.db")]
    database: PathBuf,

    /// Transform ids or names to resolve.
    queries: Vec<String>,

    /// Say more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Say less.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_numeric(query: &str) -> Option<u32> {
    let trimmed = query.trim();
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if trimmed.len() > 1 && trimmed.starts_with('0') {
        return u32::from_str_radix(&trimmed[1..], 8).ok();
    }
    trimmed.parse().ok()
}

fn lookup(db: &Database, query: &str) {
    if let Some(tid) = parse_numeric(query) {
        if tid >= db.num(microfractal::db::layout::SectionId::TransformNameFwd) {
            println!("tid={} not found", tid);
        } else {
            let rid = db.transform_rev_id(tid);
            println!(
                "fwd={}:{} rev={}:{}",
                tid,
                db.transform_name_fwd(tid),
                rid,
                db.transform_name_fwd(rid)
            );
        }
        return;
    }

    for ch in query.bytes() {
        if !ch.is_ascii_lowercase() {
            println!("invalid transform: \"{}\"", query);
            return;
        }
        if ch >= b'a' + MAXSLOTS as u8 {
            println!("transform out-of-bounds: \"{}\"", query);
            return;
        }
    }

    let full_name = match perm_from_name(query) {
        Some(perm) => name_of(&perm),
        None => {
            println!("invalid transform: \"{}\"", query);
            return;
        }
    };
    match db.lookup_fwd_transform(&full_name) {
        None => println!("\"{}\" not found", query),
        Some(tid) => {
            let rid = db.transform_rev_id(tid);
            println!(
                "fwd={}:{} rev={}:{}",
                tid,
                db.transform_name_fwd(tid),
                rid,
                db.transform_name_fwd(rid)
            );
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let db = Database::open(&args.database)
        .with_context(|| format!("open {}", args.database.display()))?;
    if !db.has_transforms() {
        anyhow::bail!("missing transform section: {}", args.database.display());
    }

    for query in &args.queries {
        lookup(&db, query);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.quiet { "error" } else { "info" }),
    )
    .format_timestamp_secs()
    .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}", serde_json::json!({ "error": format!("{:#}", error) }));
            ExitCode::FAILURE
        }
    }
}
