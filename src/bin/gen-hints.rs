// SPDX-License-Identifier: Apache-2.0

//! Tallies per-signature imprint counts for every interleave setting.
//!
//! Imprint storage is the scarce resource of catalogue builds and the
//! counts are non-linear in the interleave, so they are measured rather
//! than estimated: for each signature the tool counts the exact number
//! of imprints at every allowed setting and stores the vector in the
//! hint section. The sweep is slow; `--sid` and `--task` slice it for
//! cluster runs, `--text` transports partial results as text.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;

use microfractal::db::layout::SectionId;
use microfractal::db::records::Hint;
use microfractal::db::Database;
use microfractal::generator;
use microfractal::hints;
use microfractal::metrics::{self, HINT_SLOTS, INTERLEAVE_METRICS};
use microfractal::planner::{self, Overrides, Settings};
use microfractal::{BuildFlags, MAXSLOTS};

/// Collect imprint tallies per signature and interleave.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input database.
    input: PathBuf,

    /// Output database; omit for a read-only scan.
    output: Option<PathBuf>,

    /// Overwrite the output database if it already exists.
    #[arg(long)]
    force: bool,

    /// Read hint lines from a file instead of tallying.
    #[arg(long)]
    load: Option<PathBuf>,

    /// Maximum number of hints.
    #[arg(long)]
    maxhint: Option<u32>,

    /// Size of the hint index (prime).
    #[arg(long)]
    hintindexsize: Option<u32>,

    /// Index/data size ratio.
    #[arg(long, default_value_t = metrics::DEFAULT_RATIO)]
    ratio: f64,

    /// QnTF-only normalisation (for flag compatibility checks).
    #[arg(long)]
    pure: bool,

    /// Sid range `[lo,]hi` to tally.
    #[arg(long)]
    sid: Option<String>,

    /// Task partition `id,last`, or `sge`; slices the sid range.
    #[arg(long)]
    task: Option<String>,

    /// Emit `name<TAB>tally...` lines for joining partial runs.
    #[arg(long)]
    text: bool,

    /// Say more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Say less.
    #[arg(short, long)]
    quiet: bool,
}

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

fn parse_range(option: &str, value: &str) -> anyhow::Result<(u32, u32)> {
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

/// Reads `name<TAB>tally...` lines and attaches them to the named
/// signatures.
fn hints_from_file(db: &mut Database, path: &PathBuf) -> anyhow::Result<u32> {
    let file = File::open(path).with_context(|| format!("fopen({}) failed", path.display()))?;
    let reader = BufReader::new(file);
    let mut num_loaded = 0u32;

    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let name = fields.next().with_context(|| format!("bad/empty line {}", line_number))?;

        let mut hint = Hint { num_stored: [0; HINT_SLOTS] };
        let mut count = 0;
        for (slot, field) in fields.enumerate() {
            if slot >= HINT_SLOTS {
                bail!("line {} has too many tallies", line_number);
            }
            hint.num_stored[slot] = field
                .parse()
                .with_context(|| format!("line {} tally {} not a number", line_number, slot))?;
            count += 1;
        }
        if count < INTERLEAVE_METRICS.len() {
            bail!("line {} missing tallies", line_number);
        }

        let (_, sid) = db.lookup_signature(name)?;
        if sid == 0 {
            bail!("line {}: signature \"{}\" not in database", line_number, name);
        }

        let (slot, existing) = db.lookup_hint(&hint)?;
        let hid = if existing != 0 {
            existing
        } else {
            let hid = db.add_hint(&hint)?;
            db.index_set(SectionId::HintIndex, slot, hid);
            hid
        };
        let mut signature = db.signature(sid);
        signature.hint_id = hid;
        db.set_signature(sid, signature);
        num_loaded += 1;
    }
    Ok(num_loaded)
}

fn run(args: &Args) -> anyhow::Result<()> {
    if let Some(output) = &args.output {
        if output.exists() && !args.force {
            bail!("{} already exists. Use --force to overwrite", output.display());
        }
    }

    let input = Database::open(&args.input)
        .with_context(|| format!("open {}", args.input.display()))?;

    let read_only = args.output.is_none() && !args.text;
    if read_only {
        bail!("nothing to do: specify an output database or --text");
    }

    // Hints and signatures are written; everything else rides along.
    let inherit_mask = SectionId::SignatureIndex.mask()
        | SectionId::Imprint.mask()
        | SectionId::ImprintIndex.mask()
        | SectionId::Member.mask()
        | SectionId::MemberIndex.mask()
        | SectionId::Pair.mask()
        | SectionId::PairIndex.mask();

    let settings = Settings {
        overrides: Overrides {
            max_hint: args.maxhint.unwrap_or(0),
            hint_index_size: args.hintindexsize.unwrap_or(0),
            ..Overrides::default()
        },
        ratio: args.ratio,
        read_only,
        copy_on_write: false,
        pure: args.pure,
    };

    let metric_nodes = if input.num(SectionId::Signature) > 3 { 4 } else { 1 };
    let plan = planner::size_sections(&input, &settings, metric_nodes, inherit_mask, 0)?;

    let mut store = Database::new();
    store.creation_flags = input.creation_flags;
    planner::populate(&mut store, &input, &plan, &settings)?;

    let index_rebuilds = plan.rebuild_mask
        & (SectionId::SignatureIndex.mask() | SectionId::HintIndex.mask());
    planner::rebuild_indices(&mut store, index_rebuilds)?;

    // Resolve the sid slice: an explicit range, or a task slice of the
    // full signature section.
    let mut sid_window = match &args.sid {
        Some(range) => parse_range("sid", range)?,
        None => (0, 0),
    };
    if let Some(task) = &args.task {
        let (id, last) = if task == "sge" {
            generator::sge_task()?
        } else {
            let (id, last) = parse_range("task", task)?;
            if id == 0 || last == 0 || id > last {
                bail!("--task id/last out of bounds: {},{}", id, last);
            }
            (id, last)
        };
        let num_signature = store.num(SectionId::Signature) as u64;
        let window = generator::task_window(id, last, num_signature);
        sid_window = (window.lo as u32, window.hi as u32);
    }

    if let Some(load) = &args.load {
        let num_loaded = hints_from_file(&mut store, load)?;
        log::info!("read {} hints", num_loaded);
    } else {
        hints::collect_hints(&mut store, sid_window)?;
    }

    if args.text {
        for sid in 1..store.num(SectionId::Signature) {
            let signature = store.signature(sid);
            if signature.hint_id == 0 {
                continue;
            }
            let hint = store.hint(signature.hint_id);
            let tallies: Vec<String> = hint.num_stored[..INTERLEAVE_METRICS.len()]
                .iter()
                .map(u32::to_string)
                .collect();
            println!("{}\t{}", signature.name_str(), tallies.join("\t"));
        }
    }

    // Neither a failed write nor a terminate signal mid-write may leave
    // a partial output behind.
    if let Some(output) = &args.output {
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
        let mut summary = serde_json::json!({
            "done": "gen-hints",
            "numSlot": MAXSLOTS,
            "pure": BuildFlags::from_bits(store.creation_flags).pure as u32,
            "numSignature": store.num(SectionId::Signature),
            "numHint": store.num(SectionId::Hint),
        });
        if let Some(output) = &args.output {
            summary["filename"] = serde_json::json!(output.display().to_string());
        }
        eprintln!("{}", summary);
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
