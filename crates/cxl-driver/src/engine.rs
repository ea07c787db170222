//! Batch streaming: the whole corpus through the L2 engine, one batch at a time.
//!
//! ```text
//! query.bin ──read──▶ host page ──Q16.16──▶ query buffer (device pool)
//!
//! base.bin ──read──▶ staging (host) ──Q16.16──▶ destination (device) ──▶ launch ──▶ cycles
//!              └──────────────── repeated for every batch ────────────────┘
//! ```
//!
//! One [`StreamEngine::run`] owns every buffer and the CSR mapping for its
//! whole duration. All of them are scoped: whichever step fails, the
//! buffers go back to their pools exactly once and the CSR block is unmapped.

use crate::corpus::{CorpusShape, VectorFile};
use crate::error::{CxlError, Result};
use crate::launch::{BatchLaunch, CancelToken, LaunchDriver, PollConfig};
use crate::memory::{page_align, ContigBuffer, PoolId, PoolSet};
use crate::mmio::{CsrMapper, RegisterIo};
use crate::report::{deliver_all, BatchProgress, FileSink, PassRecord, ReportSink, StreamReport};
use cxl_chip::fixed;
use cxl_chip::window::{CxlWindow, Translation, TYPICAL_BASE, TYPICAL_NODE};
use std::path::PathBuf;
use std::time::Instant;

/// Parameters of one streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Base corpus (raw f32, row-major)
    pub base_path: PathBuf,
    /// Query vector (raw f32)
    pub query_path: PathBuf,
    /// Vectors in the corpus
    pub total_vectors: u64,
    /// Samples per vector
    pub dimension: u32,
    /// Vectors per batch (0 or more than the corpus means one batch)
    pub batch_vectors: u64,
    /// Clock assumed for the time estimate
    pub clock_mhz: u32,
    /// Pool the accelerator reads from
    pub device_pool: PoolId,
    /// Host physical base of the CXL window
    pub window_base: u64,
    /// Completion polling
    pub poll: PollConfig,
    /// Where to write the report, in addition to the engine's sinks
    pub report_path: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data/base.bin"),
            query_path: PathBuf::from("data/query.bin"),
            total_vectors: 10_000,
            dimension: 128,
            batch_vectors: 4096,
            clock_mhz: 400,
            device_pool: PoolId::Node(TYPICAL_NODE),
            window_base: TYPICAL_BASE,
            poll: PollConfig::default(),
            report_path: None,
        }
    }
}

impl StreamConfig {
    /// Check what clamping cannot fix.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero dimension or a zero poll budget.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(CxlError::invalid_config("dimension must be non-zero"));
        }
        if self.poll.max_attempts == 0 {
            return Err(CxlError::invalid_config("poll budget must allow at least one attempt"));
        }
        Ok(())
    }

    /// Corpus shape.
    pub const fn shape(&self) -> CorpusShape {
        CorpusShape::new(self.total_vectors, self.dimension)
    }

    /// CXL window implied by the device pool and window base.
    pub const fn window(&self) -> CxlWindow {
        let node = match self.device_pool {
            PoolId::Node(n) => n,
            PoolId::Host => TYPICAL_NODE,
        };
        CxlWindow::new(self.window_base, node)
    }

    /// Batch split after clamping.
    pub fn plan(&self) -> BatchPlan {
        BatchPlan::new(self.total_vectors, self.batch_vectors)
    }
}

/// Sizes of successive batches: full batches, then the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    total: u64,
    batch: u64,
    issued: u64,
}

impl BatchPlan {
    /// Split `total` vectors into batches of `requested`, clamped to `1..=total`.
    pub const fn new(total: u64, requested: u64) -> Self {
        let batch = if requested == 0 || requested > total {
            total
        } else {
            requested
        };
        Self {
            total,
            batch,
            issued: 0,
        }
    }

    /// Vectors per full batch.
    pub const fn batch_vectors(&self) -> u64 {
        self.batch
    }

    /// Number of batches, `ceil(total / batch)`.
    pub const fn passes(&self) -> u64 {
        if self.batch == 0 {
            0
        } else {
            self.total.div_ceil(self.batch)
        }
    }
}

impl Iterator for BatchPlan {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let left = self.total - self.issued;
        if left == 0 || self.batch == 0 {
            return None;
        }
        let n = left.min(self.batch);
        self.issued += n;
        Some(n)
    }
}

/// Streams a corpus through the accelerator.
///
/// `run` takes `&mut self`: the CSR block is exclusively owned by one call.
pub struct StreamEngine<M> {
    mapper: M,
    pools: PoolSet,
    sinks: Vec<Box<dyn ReportSink + Send>>,
    cancel: Option<CancelToken>,
}

impl<M: std::fmt::Debug> std::fmt::Debug for StreamEngine<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("mapper", &self.mapper)
            .field("pools", &self.pools)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl<M: CsrMapper> StreamEngine<M> {
    /// Engine mapping CSRs through `mapper` and staging in `pools`.
    pub fn new(mapper: M, pools: PoolSet) -> Self {
        Self {
            mapper,
            pools,
            sinks: Vec::new(),
            cancel: None,
        }
    }

    /// Deliver every report to `sink` too.
    #[must_use]
    pub fn with_sink(mut self, sink: impl ReportSink + Send + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Abort polling when `token` fires.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Memory pools.
    pub const fn pools(&self) -> &PoolSet {
        &self.pools
    }

    /// Stream the corpus described by `cfg`.
    ///
    /// The report is delivered to the sinks only if at least one batch
    /// completed. A device timeout aborts the call and discards the
    /// statistics gathered so far.
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound`/`ShortRead` for missing or short inputs,
    /// `Allocation` if a pool cannot supply a buffer, `Mapping` if the CSR
    /// block cannot be mapped, and `DeviceTimeout`/`Cancelled` if a batch
    /// does not complete.
    pub fn run(&mut self, cfg: &StreamConfig) -> Result<StreamReport> {
        cfg.validate()?;
        let shape = cfg.shape();
        let window = cfg.window();
        let plan = cfg.plan();
        let started = Instant::now();

        tracing::info!(
            "L2 stream: {} vectors × {} dims, batch={} ({} passes), pool={}, window={:#x}",
            shape.total_vectors,
            shape.dimension,
            plan.batch_vectors(),
            plan.passes(),
            cfg.device_pool,
            cfg.window_base
        );

        let mut query = self.load_query(cfg, &window)?;

        if plan.passes() == 0 {
            tracing::info!("L2 stream: empty corpus, nothing to launch");
            query.release();
            return Ok(StreamReport::new(cfg.dimension, cfg.clock_mhz, Vec::new()));
        }

        let batch_bytes = usize::try_from(plan.batch_vectors())
            .ok()
            .and_then(|v| v.checked_mul(shape.bytes_per_vector()))
            .map(page_align)
            .ok_or_else(|| CxlError::invalid_config("batch does not fit in memory"))?;

        let mut staging = self.pools.allocate(batch_bytes, PoolId::Host)?;
        let mut dest = self.pools.allocate(batch_bytes, cfg.device_pool)?;
        place(&mut dest, &window, "batch");

        let mut base = VectorFile::open(&cfg.base_path)?;

        let mut driver = LaunchDriver::new(self.mapper.map()?, cfg.poll);
        if let Some(token) = &self.cancel {
            driver = driver.with_cancel(token.clone());
        }

        let outcome = stream(
            &mut driver,
            plan,
            &mut base,
            &mut staging,
            &mut dest,
            query.device_addr(),
            shape,
        );

        drop(driver);
        dest.release();
        staging.release();
        query.release();

        let passes = outcome?;
        let report = StreamReport::new(cfg.dimension, cfg.clock_mhz, passes);
        tracing::info!(
            "L2 stream done in {:?}: {} vectors, {} cycles",
            started.elapsed(),
            report.total_vecs,
            report.cycles_total
        );

        let file_sink = cfg.report_path.as_ref().map(FileSink::new);
        let sinks = self
            .sinks
            .iter()
            .map(|s| &**s as &dyn ReportSink)
            .chain(file_sink.iter().map(|s| s as &dyn ReportSink));
        deliver_all(&report, sinks);

        Ok(report)
    }

    /// Read, convert and place the query in the device pool.
    fn load_query(&self, cfg: &StreamConfig, window: &CxlWindow) -> Result<ContigBuffer> {
        let bytes = cfg.shape().bytes_per_vector();
        let mut query = self.pools.allocate(page_align(bytes), cfg.device_pool)?;
        place(&mut query, window, "query");

        let mut page = self.pools.allocate(page_align(bytes), PoolId::Host)?;
        let staged = &mut page.as_mut_slice()[..bytes];
        VectorFile::open(&cfg.query_path)?.read_next(staged)?;
        fixed::convert_in_place(staged);
        query.as_mut_slice()[..bytes].copy_from_slice(staged);
        page.release();

        tracing::debug!(
            "Query loaded from {} ({bytes} bytes, dev={:#x})",
            cfg.query_path.display(),
            query.device_addr()
        );
        Ok(query)
    }
}

fn place(buf: &mut ContigBuffer, window: &CxlWindow, what: &str) {
    match buf.translate(window) {
        Translation::Device(dpa) => {
            tracing::debug!("{what} buffer: pa={:#x} -> dpa={dpa:#x}", buf.phys_addr());
        }
        Translation::Passthrough { addr, reason } => {
            tracing::warn!("{what} buffer: {reason}, using raw address {addr:#x}");
        }
    }
}

fn stream<R: RegisterIo>(
    driver: &mut LaunchDriver<R>,
    plan: BatchPlan,
    base: &mut VectorFile,
    staging: &mut ContigBuffer,
    dest: &mut ContigBuffer,
    query_addr: u64,
    shape: CorpusShape,
) -> Result<Vec<PassRecord>> {
    let mut progress = BatchProgress::default();
    let mut passes = Vec::new();

    for (pass, vectors) in (0u64..).zip(plan) {
        // The pass never exceeds the batch the buffers were sized for.
        #[allow(clippy::cast_possible_truncation)]
        let bytes = vectors as usize * shape.bytes_per_vector();

        let stage = staging.as_mut_slice();
        stage[bytes..].fill(0);
        base.read_next(&mut stage[..bytes])?;
        fixed::convert_in_place(&mut stage[..bytes]);
        dest.as_mut_slice().copy_from_slice(staging.as_slice());

        let launch = BatchLaunch {
            pass,
            batch_addr: dest.device_addr(),
            query_addr,
            vectors,
            dimension: shape.dimension,
        };
        let out = driver.launch(&launch).inspect_err(|e| {
            tracing::warn!(
                "Aborting after {} passes ({} vectors, {} cycles discarded): {e}",
                progress.passes_completed,
                progress.vectors_processed,
                progress.cycles_accumulated
            );
        })?;

        let record = PassRecord {
            pass,
            vectors,
            cycles: out.cycles,
            result: out.result,
        };
        progress.record(&record);
        tracing::info!(
            "pass={pass} vecs={vectors} cyc={} acc={}",
            out.cycles,
            progress.cycles_accumulated
        );
        passes.push(record);
    }

    Ok(passes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_splits_with_remainder() {
        let plan = BatchPlan::new(10_000, 4096);
        assert_eq!(plan.passes(), 3);
        assert_eq!(plan.collect::<Vec<_>>(), vec![4096, 4096, 1808]);
    }

    #[test]
    fn plan_clamps_batch() {
        assert_eq!(BatchPlan::new(100, 0).collect::<Vec<_>>(), vec![100]);
        assert_eq!(BatchPlan::new(100, 1000).collect::<Vec<_>>(), vec![100]);
        assert_eq!(BatchPlan::new(0, 16).passes(), 0);
        assert_eq!(BatchPlan::new(0, 16).next(), None);
    }

    #[test]
    fn plan_sums_to_total() {
        for (total, batch) in [(1, 1), (7, 3), (4096, 4096), (4097, 4096), (12_345, 1000)] {
            let plan = BatchPlan::new(total, batch);
            let sizes: Vec<u64> = plan.collect();
            assert_eq!(sizes.iter().sum::<u64>(), total);
            assert_eq!(sizes.len() as u64, total.div_ceil(batch));
            assert_eq!(plan.passes(), sizes.len() as u64);
        }
    }

    #[test]
    fn default_config_matches_reference_setup() {
        let cfg = StreamConfig::default();
        assert_eq!((cfg.total_vectors, cfg.dimension, cfg.batch_vectors), (10_000, 128, 4096));
        assert_eq!(cfg.clock_mhz, 400);
        assert_eq!(cfg.device_pool, PoolId::Node(1));
        assert_eq!(cfg.window().base(), 0x80_8000_0000);
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let cfg = StreamConfig {
            dimension: 0,
            ..StreamConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(CxlError::InvalidConfig { .. })));
    }
}
