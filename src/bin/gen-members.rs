// SPDX-License-Identifier: Apache-2.0

//! Collects signature group members into the catalogue database.
//!
//! Candidates arrive from a textual list (`--load`) or, for 0/1-node
//! builds, from the built-in seeds; each is classified through the
//! associative imprint index and admitted into its signature group when
//! it wins the group's safety/size comparison. A writable build ends
//! with the finaliser sorting and re-indexing the member section.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;

use microfractal::db::layout::SectionId;
use microfractal::db::records::{MEMMASK_COMP, MEMMASK_DELETE, MEMMASK_DEPR, MEMMASK_LOCKED, MEMMASK_SAFE, SIGMASK_SAFE};
use microfractal::db::Database;
use microfractal::generator::{self, CandidateSink, Window};
use microfractal::members::{seed_signatures, Decision, MemberEngine};
use microfractal::metrics;
use microfractal::planner::{self, Overrides, Settings};
use microfractal::tree::{score_name, MicroTree};
use microfractal::{hints, imprint, BuildFlags, MAXSLOTS};

/// Collect signature group members.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input database.
    input: PathBuf,

    /// Tree size in nodes to collect for this invocation.
    num_nodes: u32,

    /// Output database; omit for a read-only scan.
    output: Option<PathBuf>,

    /// Overwrite the output database if it already exists.
    #[arg(long)]
    force: bool,

    /// Do not drive the built-in candidate seeds.
    #[arg(long)]
    no_generate: bool,

    /// Read candidates from a file instead of generating.
    #[arg(long)]
    load: Option<PathBuf>,

    /// Imprint index interleave; one of the allowed 9! divisors.
    #[arg(long)]
    interleave: Option<u32>,

    /// Maximum number of signatures.
    #[arg(long)]
    maxsignature: Option<u32>,
    /// Maximum number of hints.
    #[arg(long)]
    maxhint: Option<u32>,
    /// Maximum number of imprints.
    #[arg(long)]
    maximprint: Option<u32>,
    /// Maximum number of members.
    #[arg(long)]
    maxmember: Option<u32>,
    /// Maximum number of member/transform pairs.
    #[arg(long)]
    maxpair: Option<u32>,

    /// Size of the signature index (prime).
    #[arg(long)]
    signatureindexsize: Option<u32>,
    /// Size of the hint index (prime).
    #[arg(long)]
    hintindexsize: Option<u32>,
    /// Size of the imprint index (prime).
    #[arg(long)]
    imprintindexsize: Option<u32>,
    /// Size of the member index (prime).
    #[arg(long)]
    memberindexsize: Option<u32>,
    /// Size of the pair index (prime).
    #[arg(long)]
    pairindexsize: Option<u32>,

    /// Index/data size ratio.
    #[arg(long, default_value_t = metrics::DEFAULT_RATIO)]
    ratio: f64,

    /// QnTF-only normalisation.
    #[arg(long)]
    pure: bool,
    /// Enable expensive invariant assertions.
    #[arg(long)]
    paranoid: bool,
    /// Rebuild imprints for empty/unsafe signature groups only.
    #[arg(long = "unsafe")]
    unsafe_only: bool,
    /// Imprint add-if-not-found bulk mode.
    #[arg(long)]
    ainf: bool,
    /// Group members by scalar score instead of node count.
    #[arg(long)]
    score: bool,

    /// Drop the level-1 indices from the saved database.
    #[arg(long)]
    no_saveindex: bool,

    /// Sid range filter `[lo,]hi` for imprint rebuilds.
    #[arg(long)]
    sid: Option<String>,

    /// Candidate window `[lo,]hi`.
    #[arg(long)]
    window: Option<String>,

    /// Task partition `id,last`, or `sge` to read the scheduler
    /// environment.
    #[arg(long)]
    task: Option<String>,

    /// Stop cleanly when the database is about to overflow.
    #[arg(long)]
    truncate: bool,

    /// Textual output: 1=names won, 2=compare log, 3=sorted names,
    /// 4=full members, 5=sql.
    #[arg(long)]
    text: Option<u8>,

    /// Say more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Say less.
    #[arg(short, long)]
    quiet: bool,
}

/// End-of-run report, one JSON line on stderr.
#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary<'a> {
    done: &'a str,
    num_slot: usize,
    pure: u32,
    interleave: u32,
    num_node: u32,
    num_imprint: u32,
    num_signature: u32,
    num_member: u32,
    num_empty: u32,
    num_unsafe: u32,
    num_pair: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    window_lo: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    window_hi: Option<u64>,
}

const TEXT_WON: u8 = 1;
const TEXT_COMPARE: u8 = 2;
const TEXT_BRIEF: u8 = 3;
const TEXT_VERBOSE: u8 = 4;
const TEXT_SQL: u8 = 5;

/// Arms SIGINT/SIGHUP to unlink the partially-written output database.
///
/// The handler is minimal and terminal: unlink the path, leave with a
/// non-zero status. Returns the registrations so the caller can disarm
/// them once the file is complete.
fn unlink_on_termination(output: &std::path::Path) -> anyhow::Result<Vec<signal_hook::SigId>> {
    use signal_hook::consts::{SIGHUP, SIGINT};

    let mut ids = Vec::new();
    for signal in [SIGINT, SIGHUP] {
        let path = output.to_path_buf();
        let id = unsafe {
            signal_hook::low_level::register(signal, move || {
                let _ = std::fs::remove_file(&path);
                signal_hook::low_level::exit(1);
            })
        }?;
        ids.push(id);
    }
    Ok(ids)
}

/// Parses `[lo,]hi` range options.
fn parse_range(option: &str, value: &str) -> anyhow::Result<(u64, u64)> {
    let parts: Vec<&str> = value.split(',').collect();
    match parts.as_slice() {
        [hi] => Ok((0, hi.parse().with_context(|| format!("--{}={}", option, value))?)),
        [lo, hi] => Ok((
            lo.parse().with_context(|| format!("--{}={}", option, value))?,
            hi.parse().with_context(|| format!("--{}={}", option, value))?,
        )),
        _ => bail!("--{}={} malformed, expected [lo,]hi", option, value),
    }
}

/// Streams engine decisions, printing the per-candidate text modes.
struct CollectSink<'e, 'db> {
    engine: &'e mut MemberEngine<'db>,
    text: Option<u8>,
}

impl CandidateSink for CollectSink<'_, '_> {
    fn found_tree(
        &mut self,
        tree: &MicroTree,
        name: &str,
        num_placeholder: u32,
        num_endpoint: u32,
        num_back_ref: u32,
    ) -> anyhow::Result<bool> {
        let (keep_going, decision) = self
            .engine
            .found_tree(tree, name, num_placeholder, num_endpoint, num_back_ref)?;

        match self.text {
            Some(TEXT_COMPARE) => {
                let sid = match &decision {
                    Decision::SkipSize { sid }
                    | Decision::SkipUnsafe { sid }
                    | Decision::Accepted { sid, .. } => *sid,
                    _ => 0,
                };
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    self.engine.progress,
                    sid,
                    decision.cmp_char(),
                    name,
                    tree.node_count(),
                    num_placeholder,
                    num_endpoint,
                    num_back_ref
                );
            }
            Some(TEXT_WON) => {
                if matches!(decision, Decision::Accepted { .. }) {
                    println!("{}", name);
                }
            }
            _ => {}
        }

        self.engine.progress += 1;
        Ok(keep_going)
    }
}

fn member_flags_text(flags: u32, group_safe: bool) -> String {
    let mut text = String::new();
    if group_safe {
        text.push(if flags & MEMMASK_SAFE != 0 { 'S' } else { 's' });
    }
    if flags & MEMMASK_COMP != 0 {
        text.push('C');
    }
    if flags & MEMMASK_LOCKED != 0 {
        text.push('L');
    }
    if flags & MEMMASK_DEPR != 0 {
        text.push('D');
    }
    if flags & MEMMASK_DELETE != 0 {
        text.push('X');
    }
    text
}

/// Emits the post-finalise text modes.
fn print_members(db: &Database, mode: u8) {
    match mode {
        TEXT_BRIEF => {
            for mid in 1..db.num(SectionId::Member) {
                let member = db.member(mid);
                if member.sid != 0 {
                    println!("{}", member.name_str());
                }
            }
        }
        TEXT_VERBOSE => {
            for sid in 1..db.num(SectionId::Signature) {
                let signature = db.signature(sid);
                let group_safe = signature.flags & SIGMASK_SAFE != 0;
                let mut mid = signature.first_member;
                while mid != 0 {
                    let member = db.member(mid);
                    let component = |pid: u32| {
                        if pid == 0 {
                            "0:-/0:-".to_string()
                        } else {
                            let pair = db.pair(pid);
                            format!(
                                "{}:{}/{}:{}",
                                pair.mid,
                                db.member(pair.mid).name_str(),
                                pair.tid,
                                &db.transform_name_fwd(pair.tid)[..member.num_placeholder as usize]
                            )
                        }
                    };
                    let heads: Vec<String> = member
                        .heads
                        .iter()
                        .map(|&head| format!("{}:{}", head, db.member(head).name_str()))
                        .collect();
                    println!(
                        "{}\t{}\t{}\t{}\t{:03x}\t{}\t{}\t{}\t{}\t{}",
                        mid,
                        sid,
                        member.tid,
                        member.name_str(),
                        score_name(member.name_str()),
                        component(member.qmt),
                        component(member.tmt),
                        component(member.fmt),
                        heads.join("\t"),
                        member_flags_text(member.flags, group_safe),
                    );
                    mid = member.next_member;
                }
            }
        }
        TEXT_SQL => {
            for mid in 1..db.num(SectionId::Member) {
                let member = db.member(mid);
                if member.sid == 0 {
                    continue;
                }
                println!(
                    "INSERT INTO member (mid,sid,tid,name,size,numplaceholder,numendpoint,numbackref,safe) \
                     VALUES ({},{},{},'{}',{},{},{},{},{});",
                    mid,
                    member.sid,
                    member.tid,
                    member.name_str(),
                    member.size,
                    member.num_placeholder,
                    member.num_endpoint,
                    member.num_back_ref,
                    (member.flags & MEMMASK_SAFE != 0) as u32
                );
            }
        }
        _ => {}
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let flags = BuildFlags {
        pure: args.pure,
        paranoid: args.paranoid,
        unsafe_only: args.unsafe_only,
        ainf: args.ainf,
    };

    if let Some(output) = &args.output {
        if output.exists() && !args.force {
            bail!("{} already exists. Use --force to overwrite", output.display());
        }
    }
    if let Some(load) = &args.load {
        if !load.exists() {
            bail!("{} does not exist", load.display());
        }
    }

    // Candidate window resolution: explicit --window, or a --task slice
    // of the metrics-predicted candidate count.
    let mut window = Window::default();
    if let Some(task) = &args.task {
        let (id, last) = if task == "sge" {
            generator::sge_task()?
        } else {
            let (id, last) = parse_range("task", task)?;
            if id == 0 || last == 0 || id > last {
                bail!("--task id/last out of bounds: {},{}", id, last);
            }
            (id as u32, last as u32)
        };
        let preset = metrics::generator_metrics(args.pure, args.num_nodes)
            .context("no preset for --task")?;
        window = generator::task_window(id, last, preset.num_progress);
    }
    if let Some(range) = &args.window {
        let (lo, hi) = parse_range("window", range)?;
        window = Window { lo, hi };
        if hi != 0 && lo >= hi {
            bail!("--window low exceeds high");
        }
    }
    let sid_window = match &args.sid {
        Some(range) => {
            let (lo, hi) = parse_range("sid", range)?;
            (lo as u32, hi as u32)
        }
        None => (0, 0),
    };

    // Open the input; a missing input is a genesis build.
    let input = if args.input.exists() {
        Database::open(&args.input)
            .with_context(|| format!("open {}", args.input.display()))?
    } else {
        log::warn!("{} missing, starting a genesis build", args.input.display());
        Database::new()
    };

    let db_flags = BuildFlags::from_bits(input.creation_flags);
    if db_flags != flags {
        log::warn!(
            "database/system flags differ: database={:?} current={:?}",
            db_flags,
            flags
        );
    }

    let read_only = args.output.is_none()
        && args.text != Some(TEXT_BRIEF)
        && args.text != Some(TEXT_VERBOSE);

    // The collection loop looks up signatures, pairs and members by
    // name, and mutates signatures; those sections must be owned.
    let mut inherit_mask = SectionId::Hint.mask()
        | SectionId::HintIndex.mask()
        | SectionId::Imprint.mask()
        | SectionId::ImprintIndex.mask()
        | SectionId::SignatureIndex.mask();
    if input.max(SectionId::SignatureIndex) == 0 {
        inherit_mask &= !SectionId::SignatureIndex.mask();
    }
    if input.num(SectionId::Imprint) == 0 {
        inherit_mask &= !SectionId::Imprint.mask();
    }
    if input.max(SectionId::ImprintIndex) == 0 {
        inherit_mask &= !SectionId::ImprintIndex.mask();
    }
    let mut rebuild_mask = 0u32;
    if args.unsafe_only || args.ainf {
        // Both modes insert imprints during the run and need the section
        // writable and regenerated.
        rebuild_mask |= SectionId::Imprint.mask() | SectionId::ImprintIndex.mask();
    }

    let mut overrides = Overrides {
        max_signature: args.maxsignature.unwrap_or(0),
        max_hint: args.maxhint.unwrap_or(0),
        max_imprint: args.maximprint.unwrap_or(0),
        max_member: args.maxmember.unwrap_or(0),
        max_pair: args.maxpair.unwrap_or(0),
        signature_index_size: args.signatureindexsize.unwrap_or(0),
        hint_index_size: args.hintindexsize.unwrap_or(0),
        imprint_index_size: args.imprintindexsize.unwrap_or(0),
        member_index_size: args.memberindexsize.unwrap_or(0),
        pair_index_size: args.pairindexsize.unwrap_or(0),
        interleave: args.interleave.unwrap_or(0),
    };
    // This tool never adds signatures to a populated input; pass its
    // size through instead of the preset.
    if overrides.max_signature == 0 && input.num(SectionId::Signature) > 1 {
        overrides.max_signature = input.num(SectionId::Signature);
    }

    let settings = Settings {
        overrides,
        ratio: args.ratio,
        read_only,
        copy_on_write: false,
        pure: args.pure,
    };

    // Populated input catalogues are at least 4-node datasets; genesis
    // builds size to what they actually collect.
    let metric_nodes = if input.num(SectionId::Signature) > 3 {
        args.num_nodes.max(4)
    } else {
        args.num_nodes
    };
    let plan = planner::size_sections(&input, &settings, metric_nodes, inherit_mask, rebuild_mask)?;

    let mut store = Database::new();
    store.creation_flags = flags.to_bits();
    planner::populate(&mut store, &input, &plan, &settings)?;

    // Genesis builds seed the two reserved groups.
    if store.num(SectionId::Signature) <= 1 {
        seed_signatures(&mut store)?;
    }

    let mut index_rebuilds = plan.rebuild_mask
        & (SectionId::SignatureIndex.mask()
            | SectionId::MemberIndex.mask()
            | SectionId::PairIndex.mask()
            | SectionId::HintIndex.mask()
            | SectionId::ImprintIndex.mask());
    if plan.rebuild_mask & SectionId::Imprint.mask() != 0 {
        // The imprint rebuild below regenerates its index itself.
        index_rebuilds &= !SectionId::ImprintIndex.mask();
    }
    planner::rebuild_indices(&mut store, index_rebuilds)?;

    if plan.rebuild_mask & SectionId::Imprint.mask() != 0 {
        if args.unsafe_only && store.num(SectionId::Hint) > 1 {
            hints::rebuild_imprints_with_hints(&mut store)?;
        } else {
            imprint::rebuild(
                &mut store,
                args.unsafe_only,
                (sid_window.0, sid_window.1),
                args.truncate,
            )?;
        }
    }

    // Collect.
    let counts = {
        let mut engine = MemberEngine::new(&mut store, flags, read_only);
        engine.truncate = args.truncate;
        engine.use_score = args.score;

        let mut stream = generator::StreamStats::default();
        {
            let mut sink = CollectSink { engine: &mut engine, text: args.text };
            if let Some(load) = &args.load {
                log::info!("reading members from file");
                stream = generator::load_candidates(load, window, flags, &mut sink)?;
            }
            if !args.no_generate && args.num_nodes <= 1 {
                let seeded = generator::seed_candidates(flags, &mut sink)?;
                stream.num_read += seeded.num_read;
                stream.stopped |= seeded.stopped;
            } else if !args.no_generate && args.load.is_none() {
                log::warn!(
                    "no candidate source for {}n{}: link a generator or use --load",
                    args.num_nodes,
                    MAXSLOTS
                );
            }
        }

        if let Some((progress, name)) = engine.truncated.clone() {
            log::warn!(
                "signature/imprint storage full, truncating at progress={} \"{}\"",
                progress,
                name
            );
        }

        log::info!(
            "numCandidate={} numMember={} numEmpty={} numUnsafe={} | skipDuplicate={} skipSize={} skipUnsafe={}",
            stream.num_read,
            engine.db.num(SectionId::Member),
            engine.counts.num_empty,
            engine.counts.num_unsafe,
            engine.counts.skip_duplicate,
            engine.counts.skip_size,
            engine.counts.skip_unsafe
        );

        if !read_only {
            engine.finalise()?;
        }
        engine.counts
    };

    if let Some(mode) = args.text {
        if mode >= TEXT_BRIEF {
            print_members(&store, mode);
        }
    }

    // Save; neither a failed write nor a terminate signal mid-write may
    // leave a partial output behind.
    if let Some(output) = &args.output {
        if args.no_saveindex {
            store.drop_level1_indices();
        }
        let guards = unlink_on_termination(output)?;
        if let Err(error) = store.save(output) {
            let _ = std::fs::remove_file(output);
            return Err(error).with_context(|| format!("save {}", output.display()));
        }
        for id in guards {
            signal_hook::low_level::unregister(id);
        }
    }

    if !args.quiet {
        let windowed = window != Window::default();
        let summary = Summary {
            done: "gen-members",
            num_slot: MAXSLOTS,
            pure: flags.pure as u32,
            interleave: store.interleave,
            num_node: args.num_nodes,
            num_imprint: store.num(SectionId::Imprint),
            num_signature: store.num(SectionId::Signature),
            num_member: store.num(SectionId::Member),
            num_empty: counts.num_empty,
            num_unsafe: counts.num_unsafe,
            num_pair: store.num(SectionId::Pair),
            filename: args.output.as_ref().map(|p| p.display().to_string()),
            window_lo: windowed.then_some(window.lo),
            window_hi: windowed.then_some(window.hi),
        };
        eprintln!("{}", serde_json::to_string(&summary)?);
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = match (args.quiet, args.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, _) => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let line = serde_json::json!({ "error": format!("{:#}", error) });
            eprintln!("{}", line);
            ExitCode::FAILURE
        }
    }
}
