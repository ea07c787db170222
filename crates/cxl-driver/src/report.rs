//! Streaming statistics and their text report.
//!
//! ```text
//! L2 stream result:
//! total_vecs=10000
//! dim=128
//! clk_mhz=400
//! cycles_total=80192
//! cycles_per_vec=8.019
//! ~time_ns=200480
//! bytes=5120000
//! ~GBps=25.538
//! ```
//!
//! The first six fields are fixed in name and order. Fractions are
//! integer thousandths; no floating point is involved.

use crate::error::{CxlError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// Header line of the text report.
pub const REPORT_HEADER: &str = "L2 stream result:";

/// One completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassRecord {
    /// Pass index, from 0
    pub pass: u64,
    /// Vectors in the batch
    pub vectors: u64,
    /// Cycles the device reported
    pub cycles: u64,
    /// Result payload the device reported
    pub result: u64,
}

/// Running totals, updated once per completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchProgress {
    /// Vectors processed
    pub vectors_processed: u64,
    /// Cycles accumulated
    pub cycles_accumulated: u64,
    /// Passes completed
    pub passes_completed: u64,
}

impl BatchProgress {
    /// Fold one completed pass in.
    pub fn record(&mut self, pass: &PassRecord) {
        self.vectors_processed += pass.vectors;
        self.cycles_accumulated += pass.cycles;
        self.passes_completed += 1;
    }
}

/// Result of one streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    /// Vectors processed
    pub total_vecs: u64,
    /// Samples per vector
    pub dim: u32,
    /// Clock assumed for cycle → time conversion
    pub clk_mhz: u32,
    /// Cycles summed over all passes
    pub cycles_total: u64,
    /// Every completed pass
    pub passes: Vec<PassRecord>,
}

fn ratio_milli(num: u64, den: u64) -> u64 {
    if den == 0 {
        return 0;
    }
    let v = u128::from(num) * 1000 / u128::from(den);
    u64::try_from(v).unwrap_or(u64::MAX)
}

impl StreamReport {
    /// Report over `passes`.
    pub fn new(dim: u32, clk_mhz: u32, passes: Vec<PassRecord>) -> Self {
        let mut progress = BatchProgress::default();
        for p in &passes {
            progress.record(p);
        }
        Self {
            total_vecs: progress.vectors_processed,
            dim,
            clk_mhz,
            cycles_total: progress.cycles_accumulated,
            passes,
        }
    }

    /// Cycles per vector in thousandths.
    pub fn cycles_per_vec_milli(&self) -> u64 {
        ratio_milli(self.cycles_total, self.total_vecs)
    }

    /// Estimated device time, `cycles × 1000 / clk_mhz` (0 without a clock).
    pub fn time_ns(&self) -> u64 {
        ratio_milli(self.cycles_total, u64::from(self.clk_mhz))
    }

    /// Corpus bytes streamed.
    pub fn bytes(&self) -> u64 {
        self.total_vecs * u64::from(self.dim) * 4
    }

    /// Device-side throughput in GB/s, thousandths (`bytes × clk_mhz / cycles`).
    pub fn gbps_milli(&self) -> u64 {
        if self.cycles_total == 0 {
            return 0;
        }
        let v = u128::from(self.bytes()) * u128::from(self.clk_mhz) / u128::from(self.cycles_total);
        u64::try_from(v).unwrap_or(u64::MAX)
    }

    /// Whether any pass completed.
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Parse the fixed fields back out of report text.
    ///
    /// # Errors
    ///
    /// Returns `ReportParse` if a fixed field is missing or malformed.
    pub fn parse(text: &str) -> Result<ReportFields> {
        text.parse()
    }
}

fn milli(v: u64) -> String {
    format!("{}.{:03}", v / 1000, v % 1000)
}

impl fmt::Display for StreamReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{REPORT_HEADER}")?;
        writeln!(f, "total_vecs={}", self.total_vecs)?;
        writeln!(f, "dim={}", self.dim)?;
        writeln!(f, "clk_mhz={}", self.clk_mhz)?;
        writeln!(f, "cycles_total={}", self.cycles_total)?;
        writeln!(f, "cycles_per_vec={}", milli(self.cycles_per_vec_milli()))?;
        writeln!(f, "~time_ns={}", self.time_ns())?;
        writeln!(f, "bytes={}", self.bytes())?;
        writeln!(f, "~GBps={}", milli(self.gbps_milli()))
    }
}

/// The fixed fields of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportFields {
    /// `total_vecs`
    pub total_vecs: u64,
    /// `dim`
    pub dim: u32,
    /// `clk_mhz`
    pub clk_mhz: u32,
    /// `cycles_total`
    pub cycles_total: u64,
    /// `cycles_per_vec`, thousandths
    pub cycles_per_vec_milli: u64,
    /// `~time_ns`
    pub time_ns: u64,
}

fn field<'a>(text: &'a str, key: &str) -> Result<&'a str> {
    text.lines()
        .find_map(|l| l.trim().strip_prefix(key).and_then(|r| r.strip_prefix('=')))
        .ok_or_else(|| CxlError::report_parse(format!("missing {key}")))
}

fn number<T: std::str::FromStr>(text: &str, key: &str) -> Result<T> {
    let raw = field(text, key)?;
    raw.trim()
        .parse()
        .map_err(|_| CxlError::report_parse(format!("{key}={raw} is not a number")))
}

fn parse_milli(text: &str, key: &str) -> Result<u64> {
    let raw = field(text, key)?.trim();
    let bad = || CxlError::report_parse(format!("{key}={raw} is not <int>.<3 digits>"));
    let (int, frac) = raw.split_once('.').ok_or_else(bad)?;
    if frac.len() != 3 {
        return Err(bad());
    }
    let int: u64 = int.parse().map_err(|_| bad())?;
    let frac: u64 = frac.parse().map_err(|_| bad())?;
    Ok(int * 1000 + frac)
}

impl std::str::FromStr for ReportFields {
    type Err = CxlError;

    fn from_str(text: &str) -> Result<Self> {
        Ok(Self {
            total_vecs: number(text, "total_vecs")?,
            dim: number(text, "dim")?,
            clk_mhz: number(text, "clk_mhz")?,
            cycles_total: number(text, "cycles_total")?,
            cycles_per_vec_milli: parse_milli(text, "cycles_per_vec")?,
            time_ns: number(text, "~time_ns")?,
        })
    }
}

/// Destination of a finished report.
pub trait ReportSink: fmt::Debug {
    /// Deliver `report`.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails. Callers treat this as non-fatal.
    fn deliver(&self, report: &StreamReport) -> Result<()>;
}

/// Writes the report to a file, replacing it.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    /// Sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for FileSink {
    fn deliver(&self, report: &StreamReport) -> Result<()> {
        std::fs::write(&self.path, report.to_string())?;
        tracing::info!("Wrote L2 stream result to {}", self.path.display());
        Ok(())
    }
}

/// Emits the report as a log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn deliver(&self, report: &StreamReport) -> Result<()> {
        tracing::info!("{report}");
        Ok(())
    }
}

/// Deliver to every sink; failures are logged and swallowed.
///
/// Returns the number of sinks that accepted the report.
pub fn deliver_all<'a>(
    report: &StreamReport,
    sinks: impl IntoIterator<Item = &'a dyn ReportSink>,
) -> usize {
    let mut ok = 0;
    for sink in sinks {
        match sink.deliver(report) {
            Ok(()) => ok += 1,
            Err(e) => tracing::error!("Failed to deliver L2 stream result via {sink:?}: {e}"),
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passes(sizes: &[u64], cycles_per_vec: u64) -> Vec<PassRecord> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &v)| PassRecord {
                pass: i as u64,
                vectors: v,
                cycles: v * cycles_per_vec,
                result: v,
            })
            .collect()
    }

    #[test]
    fn totals_and_derived_figures() {
        let r = StreamReport::new(128, 400, passes(&[4096, 4096, 1808], 8));
        assert_eq!(r.total_vecs, 10_000);
        assert_eq!(r.cycles_total, 80_000);
        assert_eq!(r.cycles_per_vec_milli(), 8_000);
        assert_eq!(r.time_ns(), 200_000);
        assert_eq!(r.bytes(), 5_120_000);
        // 5_120_000 B × 400 MHz / 80_000 cycles = 25.6 GB/s
        assert_eq!(r.gbps_milli(), 25_600);
    }

    #[test]
    fn fractional_cycles_per_vec() {
        let r = StreamReport {
            total_vecs: 3,
            dim: 128,
            clk_mhz: 0,
            cycles_total: 10,
            passes: Vec::new(),
        };
        assert_eq!(r.cycles_per_vec_milli(), 3_333);
        assert_eq!(r.time_ns(), 0, "no clock, no time");
        assert!(r.to_string().contains("cycles_per_vec=3.333\n"));
    }

    #[test]
    fn fixed_field_order() {
        let text = StreamReport::new(128, 400, passes(&[10], 5)).to_string();
        let keys: Vec<&str> = text.lines().skip(1).filter_map(|l| l.split('=').next()).collect();
        assert_eq!(
            &keys[..6],
            ["total_vecs", "dim", "clk_mhz", "cycles_total", "cycles_per_vec", "~time_ns"]
        );
        assert!(text.starts_with(REPORT_HEADER));
    }

    #[test]
    fn round_trip_recovers_fixed_fields() {
        let r = StreamReport::new(96, 250, passes(&[1000, 17], 13));
        let f = StreamReport::parse(&r.to_string()).unwrap();
        assert_eq!(f.total_vecs, r.total_vecs);
        assert_eq!(f.dim, 96);
        assert_eq!(f.clk_mhz, 250);
        assert_eq!(f.cycles_total, r.cycles_total);
        assert_eq!(f.cycles_per_vec_milli, r.cycles_per_vec_milli());
        assert_eq!(f.time_ns, r.time_ns());
    }

    #[test]
    fn parse_rejects_missing_and_malformed() {
        assert!(matches!(
            "total_vecs=1\ndim=2\n".parse::<ReportFields>(),
            Err(CxlError::ReportParse { .. })
        ));
        let bad = "total_vecs=1\ndim=2\nclk_mhz=3\ncycles_total=4\ncycles_per_vec=4.0\n~time_ns=5\n";
        assert!(bad.parse::<ReportFields>().is_err());
    }

    #[derive(Debug)]
    struct Failing;

    impl ReportSink for Failing {
        fn deliver(&self, _: &StreamReport) -> Result<()> {
            Err(std::io::Error::other("disk full").into())
        }
    }

    #[test]
    fn sink_failures_are_swallowed() {
        let r = StreamReport::new(128, 400, passes(&[1], 1));
        let sinks: [&dyn ReportSink; 2] = [&Failing, &LogSink];
        assert_eq!(deliver_all(&r, sinks), 1);
    }

    #[test]
    fn file_sink_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("l2_stream_result.txt"));
        let r = StreamReport::new(128, 400, passes(&[64], 2));
        sink.deliver(&r).unwrap();
        let text = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(text, r.to_string());
    }
}
