//! Per-stage interval profiling and the node profiler file format.
//!
//! Every stage thread owns one [`Profiler`] seeded with a shared
//! [`ProfilerBase`] captured when the worker accepts a job. At shutdown the
//! worker merges all profilers into a single binary blob per node, written
//! under `jobs/<job_id>/profiler_node_<node_id>.bin`.
//!
//! File layout (all integers little-endian):
//!
//! ```text
//! start_time_ns i64, end_time_ns i64,
//! load_worker_count u8,  { block per load worker }
//! eval_worker_count u8, profilers_per_chain u8 = 3,
//!   { per PU: block(pre), block(eval), block(post) }
//! save_worker_count u8,  { block per save worker }
//! ```
//!
//! Each self-delimited block:
//! `out_rank i64, kind str, tag str, worker_id i64, interval_count i64,
//! { label str, start_ns i64, end_ns i64 }*` with `str` encoded as
//! `u64 length + UTF-8 bytes`. The layout is consumed by external timeline
//! tooling and must stay bit-stable.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use strobe_common::{Result, StrobeError};

/// Profilers per PU chain: pre, eval, post.
const PROFILERS_PER_CHAIN: u8 = 3;

/// Shared time origin pairing a monotonic instant with its wall-clock
/// nanosecond anchoring, so intervals are absolute i64 nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct ProfilerBase {
    instant: Instant,
    epoch_ns: i64,
}

impl ProfilerBase {
    /// Capture the time origin for one job on one worker.
    pub fn capture() -> Self {
        let epoch_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self {
            instant: Instant::now(),
            epoch_ns,
        }
    }

    /// Current absolute time in nanoseconds, monotonic relative to the base.
    pub fn now_ns(&self) -> i64 {
        self.epoch_ns + self.instant.elapsed().as_nanos() as i64
    }
}

/// One recorded `(label, start, end)` interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    /// What the stage was doing.
    pub label: String,
    /// Interval start, absolute nanoseconds.
    pub start_ns: i64,
    /// Interval end, absolute nanoseconds.
    pub end_ns: i64,
}

/// Interval recorder owned by exactly one stage thread.
#[derive(Debug)]
pub struct Profiler {
    base: ProfilerBase,
    intervals: Vec<Interval>,
}

impl Profiler {
    /// Create a recorder seeded with the job's shared base.
    pub fn new(base: ProfilerBase) -> Self {
        Self {
            base,
            intervals: Vec::new(),
        }
    }

    /// Current absolute time in nanoseconds.
    pub fn now_ns(&self) -> i64 {
        self.base.now_ns()
    }

    /// Record one interval.
    pub fn add_interval(&mut self, label: &str, start_ns: i64, end_ns: i64) {
        self.intervals.push(Interval {
            label: label.to_string(),
            start_ns,
            end_ns,
        });
    }

    /// All recorded intervals in insertion order.
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }
}

/// The three profilers of one PU chain.
#[derive(Debug)]
pub struct PuProfile {
    /// Pre-evaluate stage profiler.
    pub pre: Profiler,
    /// Evaluate stage profiler.
    pub eval: Profiler,
    /// Post-evaluate stage profiler.
    pub post: Profiler,
}

/// All profilers of one node for one job, merged at shutdown.
#[derive(Debug)]
pub struct NodeProfile {
    /// Pull-loop start, absolute nanoseconds.
    pub start_time_ns: i64,
    /// Shutdown completion, absolute nanoseconds.
    pub end_time_ns: i64,
    /// Node id of the emitting worker.
    pub out_rank: i64,
    /// One profiler per load worker.
    pub load: Vec<Profiler>,
    /// One chain of profilers per PU.
    pub eval: Vec<PuProfile>,
    /// One profiler per save worker.
    pub save: Vec<Profiler>,
}

impl NodeProfile {
    /// Encode the node profile into the binary file layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.start_time_ns.to_le_bytes());
        out.extend_from_slice(&self.end_time_ns.to_le_bytes());

        out.push(self.load.len() as u8);
        for (i, profiler) in self.load.iter().enumerate() {
            encode_block(&mut out, self.out_rank, "load", "", i as i64, profiler);
        }

        out.push(self.eval.len() as u8);
        out.push(PROFILERS_PER_CHAIN);
        for (pu, chain) in self.eval.iter().enumerate() {
            encode_block(&mut out, self.out_rank, "eval", "pre", pu as i64, &chain.pre);
            encode_block(&mut out, self.out_rank, "eval", "eval", pu as i64, &chain.eval);
            encode_block(&mut out, self.out_rank, "eval", "post", pu as i64, &chain.post);
        }

        out.push(self.save.len() as u8);
        for (i, profiler) in self.save.iter().enumerate() {
            encode_block(&mut out, self.out_rank, "save", "", i as i64, profiler);
        }

        out
    }
}

fn encode_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u64).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn encode_block(
    out: &mut Vec<u8>,
    out_rank: i64,
    kind: &str,
    tag: &str,
    worker_id: i64,
    profiler: &Profiler,
) {
    out.extend_from_slice(&out_rank.to_le_bytes());
    encode_str(out, kind);
    encode_str(out, tag);
    out.extend_from_slice(&worker_id.to_le_bytes());
    out.extend_from_slice(&(profiler.intervals.len() as i64).to_le_bytes());
    for interval in &profiler.intervals {
        encode_str(out, &interval.label);
        out.extend_from_slice(&interval.start_ns.to_le_bytes());
        out.extend_from_slice(&interval.end_ns.to_le_bytes());
    }
}

/// One decoded profiler block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerBlock {
    /// Emitting node id.
    pub out_rank: i64,
    /// Stage pool kind: `load`, `eval` or `save`.
    pub kind: String,
    /// Chain position for eval blocks (`pre`/`eval`/`post`), empty otherwise.
    pub tag: String,
    /// Worker (or PU) index within the pool.
    pub worker_id: i64,
    /// Recorded intervals.
    pub intervals: Vec<Interval>,
}

/// Decoded node profiler file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProfileSummary {
    /// Pull-loop start, absolute nanoseconds.
    pub start_time_ns: i64,
    /// Shutdown completion, absolute nanoseconds.
    pub end_time_ns: i64,
    /// All blocks in file order: load pool, eval chains, save pool.
    pub blocks: Vec<ProfilerBlock>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| StrobeError::Storage("profiler file truncated".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("fixed slice")))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_str(&mut self) -> Result<String> {
        let len = u64::from_le_bytes(self.take(8)?.try_into().expect("fixed slice")) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StrobeError::Storage(format!("profiler string not utf-8: {e}")))
    }
}

fn decode_block(cursor: &mut Cursor<'_>) -> Result<ProfilerBlock> {
    let out_rank = cursor.read_i64()?;
    let kind = cursor.read_str()?;
    let tag = cursor.read_str()?;
    let worker_id = cursor.read_i64()?;
    let interval_count = cursor.read_i64()?;
    let mut intervals = Vec::with_capacity(interval_count.max(0) as usize);
    for _ in 0..interval_count {
        let label = cursor.read_str()?;
        let start_ns = cursor.read_i64()?;
        let end_ns = cursor.read_i64()?;
        intervals.push(Interval {
            label,
            start_ns,
            end_ns,
        });
    }
    Ok(ProfilerBlock {
        out_rank,
        kind,
        tag,
        worker_id,
        intervals,
    })
}

/// Parse a node profiler file for timeline reconstruction.
pub fn read_node_profile(bytes: &[u8]) -> Result<NodeProfileSummary> {
    let mut cursor = Cursor {
        data: bytes,
        pos: 0,
    };
    let start_time_ns = cursor.read_i64()?;
    let end_time_ns = cursor.read_i64()?;
    let mut blocks = Vec::new();

    let load_count = cursor.read_u8()?;
    for _ in 0..load_count {
        blocks.push(decode_block(&mut cursor)?);
    }

    let eval_count = cursor.read_u8()?;
    let per_chain = cursor.read_u8()?;
    if per_chain != PROFILERS_PER_CHAIN {
        return Err(StrobeError::Storage(format!(
            "unexpected profilers_per_chain {per_chain}"
        )));
    }
    for _ in 0..(eval_count as usize * per_chain as usize) {
        blocks.push(decode_block(&mut cursor)?);
    }

    let save_count = cursor.read_u8()?;
    for _ in 0..save_count {
        blocks.push(decode_block(&mut cursor)?);
    }

    Ok(NodeProfileSummary {
        start_time_ns,
        end_time_ns,
        blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiler_with(base: ProfilerBase, label: &str, n: usize) -> Profiler {
        let mut p = Profiler::new(base);
        for i in 0..n {
            let start = p.now_ns();
            p.add_interval(label, start, start + (i as i64 + 1) * 10);
        }
        p
    }

    #[test]
    fn node_profile_round_trips() {
        let base = ProfilerBase::capture();
        let profile = NodeProfile {
            start_time_ns: base.now_ns(),
            end_time_ns: base.now_ns() + 1_000,
            out_rank: 3,
            load: vec![profiler_with(base, "load", 2), profiler_with(base, "load", 0)],
            eval: vec![PuProfile {
                pre: profiler_with(base, "pre", 1),
                eval: profiler_with(base, "eval", 1),
                post: profiler_with(base, "post", 1),
            }],
            save: vec![profiler_with(base, "save", 4)],
        };
        let encoded = profile.encode();
        let summary = read_node_profile(&encoded).expect("decode");

        // 2 load + 3 eval + 1 save blocks.
        assert_eq!(summary.blocks.len(), 6);
        assert_eq!(summary.start_time_ns, profile.start_time_ns);
        assert_eq!(summary.blocks[0].kind, "load");
        assert_eq!(summary.blocks[0].intervals.len(), 2);
        assert_eq!(summary.blocks[2].kind, "eval");
        assert_eq!(summary.blocks[2].tag, "pre");
        assert_eq!(summary.blocks[3].tag, "eval");
        assert_eq!(summary.blocks[4].tag, "post");
        assert_eq!(summary.blocks[5].kind, "save");
        assert_eq!(summary.blocks[5].intervals.len(), 4);
        assert_eq!(summary.blocks[5].out_rank, 3);
        assert_eq!(summary.blocks[5].intervals[0].label, "save");
    }

    #[test]
    fn truncated_file_is_rejected() {
        let base = ProfilerBase::capture();
        let profile = NodeProfile {
            start_time_ns: 0,
            end_time_ns: 1,
            out_rank: 0,
            load: vec![profiler_with(base, "load", 1)],
            eval: Vec::new(),
            save: Vec::new(),
        };
        let mut encoded = profile.encode();
        encoded.truncate(encoded.len() - 3);
        assert!(read_node_profile(&encoded).is_err());
    }

    #[test]
    fn base_time_is_monotonic() {
        let base = ProfilerBase::capture();
        let a = base.now_ns();
        let b = base.now_ns();
        assert!(b >= a);
    }
}
