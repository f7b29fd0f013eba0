// SPDX-License-Identifier: Apache-2.0

//! The generator boundary.
//!
//! The combinatorial candidate generator is an external collaborator;
//! this module pins down the contract it drives and provides the two
//! in-repo candidate sources: the reserved 0-node seeds and a textual
//! candidate list (`--load`). Window and task partitioning slice the
//! candidate stream for cluster runs.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context};

use crate::tree::{count_name_features, MicroTree, DEFAULT_SKIN};
use crate::BuildFlags;

/// Callback contract between a candidate source and a consumer.
///
/// The consumer must not retain `tree` or `name` after returning.
/// Returning `false` asks the source to stop; a source must honour it on
/// the very next candidate at the latest.
pub trait CandidateSink {
    fn found_tree(
        &mut self,
        tree: &MicroTree,
        name: &str,
        num_placeholder: u32,
        num_endpoint: u32,
        num_back_ref: u32,
    ) -> anyhow::Result<bool>;
}

/// Progress slice of the candidate stream; 0 bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub lo: u64,
    pub hi: u64,
}

impl Window {
    pub fn contains(&self, progress: u64) -> bool {
        (self.lo == 0 || progress >= self.lo) && (self.hi == 0 || progress < self.hi)
    }
}

/// Splits a predicted candidate count into `last` chunks and returns the
/// window of chunk `id` (1-based). The final task is open-ended to
/// absorb prediction error.
pub fn task_window(task_id: u32, task_last: u32, num_progress: u64) -> Window {
    debug_assert!(task_id >= 1 && task_id <= task_last);
    let chunk = (num_progress / task_last as u64).max(1);
    let lo = chunk * (task_id as u64 - 1);
    let hi = if task_id == task_last { 0 } else { chunk * task_id as u64 };
    Window { lo, hi }
}

/// Reads the task slot from the cluster scheduler environment
/// (`SGE_TASK_ID` / `SGE_TASK_LAST`).
pub fn sge_task() -> anyhow::Result<(u32, u32)> {
    let id: u32 = std::env::var("SGE_TASK_ID")
        .context("missing environment SGE_TASK_ID")?
        .parse()
        .context("SGE_TASK_ID not a number")?;
    let last: u32 = std::env::var("SGE_TASK_LAST")
        .context("missing environment SGE_TASK_LAST")?
        .parse()
        .context("SGE_TASK_LAST not a number")?;
    if id < 1 || id > last {
        bail!("task id/last out of bounds: {},{}", id, last);
    }
    Ok((id, last))
}

/// Outcome of a candidate stream run.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamStats {
    /// Candidates offered, window filtering included.
    pub num_read: u64,
    /// The sink requested a stop.
    pub stopped: bool,
}

/// Feeds the two reserved 0-node candidates, constant zero and the
/// naked variable.
pub fn seed_candidates(flags: BuildFlags, sink: &mut dyn CandidateSink) -> anyhow::Result<StreamStats> {
    let mut tree = MicroTree::new(flags);
    let mut stats = StreamStats::default();

    for (name, nph, nep) in [("0", 0u32, 0u32), ("a", 1, 1)] {
        tree.parse_fast(name, DEFAULT_SKIN)
            .map_err(|e| anyhow::anyhow!("seed {}: {}", name, e))?;
        stats.num_read += 1;
        if !sink.found_tree(&tree, name, nph, nep, 0)? {
            stats.stopped = true;
            return Ok(stats);
        }
    }
    Ok(stats)
}

/// Streams candidates from a textual list: one `name [nph nep nbr]` per
/// line. Supplied counts are cross-checked against the notation; the
/// window filters by line number, first line being progress 0.
pub fn load_candidates(
    path: &Path,
    window: Window,
    flags: BuildFlags,
    sink: &mut dyn CandidateSink,
) -> anyhow::Result<StreamStats> {
    let file = File::open(path).with_context(|| format!("fopen({}) failed", path.display()))?;
    let reader = BufReader::new(file);

    let mut tree = MicroTree::new(flags);
    let mut stats = StreamStats::default();
    let mut progress: u64 = 0;

    for line in reader.lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let name = match fields.next() {
            Some(name) => name,
            None => bail!("bad/empty line at {}", progress),
        };

        let (nph, nep, nbr) = count_name_features(name);
        let supplied: Vec<u32> = fields
            .map(|f| f.parse::<u32>())
            .collect::<Result<_, _>>()
            .with_context(|| format!("line {} has non-numeric fields", progress))?;
        match supplied.as_slice() {
            [] => {}
            [s_nph, s_nep, s_nbr] => {
                if (*s_nph, *s_nep, *s_nbr) != (nph, nep, nbr) {
                    bail!("line {} has incorrect values", progress);
                }
            }
            _ => bail!("bad/empty line at {}", progress),
        }

        if !window.contains(progress) {
            progress += 1;
            continue;
        }

        tree.parse_fast(name, DEFAULT_SKIN)
            .map_err(|e| anyhow::anyhow!("line {} \"{}\": {}", progress, name, e))?;
        stats.num_read += 1;
        if !sink.found_tree(&tree, name, nph, nep, nbr)? {
            stats.stopped = true;
            break;
        }
        progress += 1;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct RecordingSink {
        names: Vec<String>,
        stop_after: Option<usize>,
    }

    impl CandidateSink for RecordingSink {
        fn found_tree(
            &mut self,
            _tree: &MicroTree,
            name: &str,
            _nph: u32,
            _nep: u32,
            _nbr: u32,
        ) -> anyhow::Result<bool> {
            self.names.push(name.to_string());
            Ok(self.stop_after.map_or(true, |n| self.names.len() < n))
        }
    }

    #[test]
    fn test_task_window_partitions() {
        let w1 = task_window(1, 4, 100);
        let w2 = task_window(2, 4, 100);
        let w4 = task_window(4, 4, 100);
        assert_eq!(w1, Window { lo: 0, hi: 25 });
        assert_eq!(w2, Window { lo: 25, hi: 50 });
        // Last task is open-ended.
        assert_eq!(w4, Window { lo: 75, hi: 0 });
        assert!(w4.contains(1_000_000));
        assert!(!w1.contains(25));
        assert!(w1.contains(0));
    }

    #[test]
    fn test_seed_candidates() {
        let mut sink = RecordingSink { names: Vec::new(), stop_after: None };
        let stats = seed_candidates(BuildFlags::default(), &mut sink).unwrap();
        assert_eq!(stats.num_read, 2);
        assert!(!stats.stopped);
        assert_eq!(sink.names, ["0", "a"]);
    }

    #[test]
    fn test_load_candidates_checks_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("candidates.lst");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "ab+ 2 2 0").unwrap();
        writeln!(file, "abc! 3 3 0").unwrap();
        drop(file);

        let mut sink = RecordingSink { names: Vec::new(), stop_after: None };
        let stats =
            load_candidates(&path, Window::default(), BuildFlags::default(), &mut sink).unwrap();
        assert_eq!(stats.num_read, 2);
        assert_eq!(sink.names, ["ab+", "abc!"]);

        // Wrong counts are fatal.
        let bad = dir.path().join("bad.lst");
        let mut file = File::create(&bad).unwrap();
        writeln!(file, "ab+ 9 9 9").unwrap();
        drop(file);
        let mut sink = RecordingSink { names: Vec::new(), stop_after: None };
        assert!(load_candidates(&bad, Window::default(), BuildFlags::default(), &mut sink).is_err());
    }

    #[test]
    fn test_load_candidates_window_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("candidates.lst");
        let mut file = File::create(&path).unwrap();
        for name in ["ab+", "ab&", "ab^", "ab>", "abc!"] {
            writeln!(file, "{}", name).unwrap();
        }
        drop(file);

        // Window selects lines 1..3.
        let mut sink = RecordingSink { names: Vec::new(), stop_after: None };
        let window = Window { lo: 1, hi: 3 };
        let stats = load_candidates(&path, window, BuildFlags::default(), &mut sink).unwrap();
        assert_eq!(stats.num_read, 2);
        assert_eq!(sink.names, ["ab&", "ab^"]);

        // The sink can stop the stream.
        let mut sink = RecordingSink { names: Vec::new(), stop_after: Some(2) };
        let stats =
            load_candidates(&path, Window::default(), BuildFlags::default(), &mut sink).unwrap();
        assert!(stats.stopped);
        assert_eq!(sink.names.len(), 2);
    }
}
