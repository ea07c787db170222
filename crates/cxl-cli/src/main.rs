//! `cxl-l2` — stream a vector corpus through the CXL L2 distance engine.
//!
//! ```text
//! USAGE:
//!   cxl-l2 stream [opts]                 Run on hardware (CSR via /dev/mem, data via devdax)
//!   cxl-l2 simulate [opts]               Same pipeline against the software device
//!   cxl-l2 fvecs-to-bin <in> <out>       Convert .fvecs to raw f32 + .meta
//!   cxl-l2 report <file>                 Parse a result file and print its fields
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cxl_chip::regs::{CSR_WINDOW_SIZE, TYPICAL_CSR_PHYS};
use cxl_chip::window::{TYPICAL_BASE, TYPICAL_NODE};
use cxl_driver::memory::page_align;
use cxl_driver::{
    Arena, CsrMapper, CsrSource, LogSink, PagePool, PollConfig, PoolId, PoolSet, SimConfig,
    SimulatedDevice, StreamConfig, StreamEngine, StreamReport, PAGE_SIZE,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cxl-l2", about = "CXL-attached L2 distance streaming", version)]
struct Cli {
    /// More logging (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Stream the corpus through the accelerator.
    Stream {
        #[command(flatten)]
        stream: StreamArgs,
        #[command(flatten)]
        hw: HardwareArgs,
    },
    /// Stream the corpus through the software device model.
    Simulate {
        #[command(flatten)]
        stream: StreamArgs,
        /// RESP polls before the completion bit appears.
        #[arg(long, default_value_t = 2)]
        latency_polls: u32,
        /// Samples the model consumes per cycle.
        #[arg(long, default_value_t = 16)]
        lanes: u32,
        /// Stop responding after this many batches.
        #[arg(long)]
        hang_after: Option<usize>,
    },
    /// Convert a .fvecs dataset to the raw f32 layout.
    FvecsToBin {
        /// Input .fvecs file.
        input: PathBuf,
        /// Output .bin file (a .meta file is written next to it).
        output: PathBuf,
        /// Expected dimension of every vector.
        #[arg(long, default_value_t = 128)]
        dim: u32,
        /// Convert at most this many vectors.
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Print the fields of a result file.
    Report {
        /// Result file written by `stream` or `simulate`.
        file: PathBuf,
    },
}

#[derive(Args)]
struct StreamArgs {
    /// Base vectors (raw f32, row-major).
    #[arg(long, env = "CXL_L2_BASE", default_value = "data/base.bin")]
    base: PathBuf,
    /// Query vector (raw f32).
    #[arg(long, env = "CXL_L2_QUERY", default_value = "data/query.bin")]
    query: PathBuf,
    /// Vectors in the base file.
    #[arg(long, default_value_t = 10_000)]
    total: u64,
    /// Samples per vector.
    #[arg(long, default_value_t = 128)]
    dim: u32,
    /// Vectors per batch (0 = whole corpus).
    #[arg(long, default_value_t = 4096)]
    batch: u64,
    /// Clock for the time estimate, MHz.
    #[arg(long, default_value_t = 400)]
    clk_mhz: u32,
    /// NUMA node of the CXL window.
    #[arg(long, default_value_t = TYPICAL_NODE)]
    cxl_nid: u32,
    /// Host physical base of the CXL window.
    #[arg(long, value_parser = parse_addr, default_value_t = TYPICAL_BASE)]
    cxl_base: u64,
    /// Sleep between completion polls, µs.
    #[arg(long, default_value_t = 500)]
    poll_us: u64,
    /// Completion polls per batch before timing out.
    #[arg(long, default_value_t = 20_000)]
    max_polls: u32,
    /// Write the result here as well.
    #[arg(long)]
    report: Option<PathBuf>,
    /// Size of each staging arena (host and CXL), MB (default: sized from the batch and query).
    #[arg(long)]
    arena_mb: Option<usize>,
}

#[derive(Args)]
struct HardwareArgs {
    /// Physical address of the CSR block (BAR1).
    #[arg(long, value_parser = parse_addr, default_value_t = TYPICAL_CSR_PHYS)]
    csr_phys: u64,
    /// Bytes to map at --csr-phys.
    #[arg(long, value_parser = parse_addr, default_value_t = CSR_WINDOW_SIZE as u64)]
    csr_len: u64,
    /// PCI sysfs resource file to map instead of /dev/mem.
    #[arg(long)]
    csr_resource: Option<PathBuf>,
    /// Device-DAX instance backing the CXL window.
    #[arg(long, default_value = "/dev/dax0.0")]
    dax: PathBuf,
    /// Physical base of --dax (default: read from sysfs).
    #[arg(long, value_parser = parse_addr)]
    dax_phys: Option<u64>,
}

/// Hex (`0x…`) or decimal address.
fn parse_addr(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Cmd::Stream { stream, hw } => cmd_stream(&stream, &hw)?,
        Cmd::Simulate {
            stream,
            latency_polls,
            lanes,
            hang_after,
        } => {
            let sim = SimConfig {
                latency_polls,
                lanes,
                hang_after,
                ..SimConfig::default()
            };
            cmd_simulate(&stream, sim)?;
        }
        Cmd::FvecsToBin {
            input,
            output,
            dim,
            limit,
        } => cmd_fvecs(&input, &output, dim, limit)?,
        Cmd::Report { file } => cmd_report(&file)?,
    }

    Ok(())
}

impl StreamArgs {
    fn config(&self) -> StreamConfig {
        StreamConfig {
            base_path: self.base.clone(),
            query_path: self.query.clone(),
            total_vectors: self.total,
            dimension: self.dim,
            batch_vectors: self.batch,
            clock_mhz: self.clk_mhz,
            device_pool: PoolId::Node(self.cxl_nid),
            window_base: self.cxl_base,
            poll: PollConfig {
                interval: Duration::from_micros(self.poll_us),
                max_attempts: self.max_polls,
            },
            report_path: self.report.clone(),
        }
    }

    /// One batch buffer plus the query buffer, per pool.
    fn arena_bytes(&self, cfg: &StreamConfig) -> Result<usize> {
        if let Some(mb) = self.arena_mb {
            return Ok(page_align(mb << 20));
        }
        let vector_bytes = cfg.shape().bytes_per_vector();
        let batch = usize::try_from(cfg.plan().batch_vectors())?;
        let batch_bytes = batch
            .checked_mul(vector_bytes)
            .context("batch size overflows")?;
        Ok(page_align(batch_bytes).max(PAGE_SIZE) + page_align(vector_bytes).max(PAGE_SIZE))
    }
}

fn run<M: CsrMapper>(mapper: M, pools: PoolSet, cfg: &StreamConfig) -> Result<StreamReport> {
    let mut engine = StreamEngine::new(mapper, pools).with_sink(LogSink);
    let report = engine.run(cfg).map_err(|e| {
        let what = if e.is_device() {
            "L2 engine unreachable or not responding (check the CSR address)"
        } else {
            "L2 stream failed"
        };
        anyhow::Error::new(e).context(what)
    })?;
    if report.is_empty() {
        println!("No vectors streamed.");
    } else {
        print!("{report}");
    }
    Ok(report)
}

fn cmd_stream(args: &StreamArgs, hw: &HardwareArgs) -> Result<()> {
    let cfg = args.config();
    let bytes = args.arena_bytes(&cfg)?;

    let host = Arena::anonymous(bytes, 0).context("host staging arena")?;
    let cxl = Arena::map_device(&hw.dax, bytes, 0, hw.dax_phys)
        .with_context(|| format!("CXL window via {}", hw.dax.display()))?;
    let pools = PoolSet::new(PagePool::new(PoolId::Host, host))
        .with_device(PagePool::new(cfg.device_pool, cxl));

    let csr = match &hw.csr_resource {
        Some(path) => CsrSource::Resource(path.clone()),
        None => CsrSource::Physical {
            addr: hw.csr_phys,
            len: usize::try_from(hw.csr_len)?,
        },
    };

    run(csr, pools, &cfg)?;
    Ok(())
}

/// Anonymous host and CXL arenas; the CXL one claims the window base.
fn simulated_pools(args: &StreamArgs, cfg: &StreamConfig) -> Result<PoolSet> {
    let bytes = args.arena_bytes(cfg)?;
    let host = Arena::anonymous(bytes, 0).context("host staging arena")?;
    let cxl = Arena::anonymous(bytes, cfg.window_base).context("simulated CXL arena")?;
    Ok(PoolSet::new(PagePool::new(PoolId::Host, host))
        .with_device(PagePool::new(cfg.device_pool, cxl)))
}

fn cmd_simulate(args: &StreamArgs, sim: SimConfig) -> Result<()> {
    let cfg = args.config();
    let pools = simulated_pools(args, &cfg)?;
    let dev = SimulatedDevice::new(sim);
    run(dev.clone(), pools, &cfg)?;
    tracing::info!("Simulated device saw {} launches", dev.launches().len());
    Ok(())
}

fn cmd_fvecs(input: &Path, output: &Path, dim: u32, limit: Option<u64>) -> Result<()> {
    let s = cxl_driver::convert_fvecs(input, output, dim, limit)
        .with_context(|| format!("converting {}", input.display()))?;
    println!("{} vectors written to {}", s.vectors, output.display());
    println!("Meta info: {}", s.meta_path.display());
    #[allow(clippy::cast_precision_loss)]
    let mb = s.bytes as f64 / (1024.0 * 1024.0);
    println!("Total size: {mb:.2} MB");
    Ok(())
}

fn cmd_report(file: &Path) -> Result<()> {
    let text =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let f = StreamReport::parse(&text)?;

    println!("Vectors        : {}", f.total_vecs);
    println!("Dimension      : {}", f.dim);
    println!("Clock          : {} MHz", f.clk_mhz);
    println!("Cycles         : {}", f.cycles_total);
    println!(
        "Cycles/vector  : {}.{:03}",
        f.cycles_per_vec_milli / 1000,
        f.cycles_per_vec_milli % 1000
    );
    println!("Time (approx.) : {} ns", f.time_ns);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxl_driver::CxlError;

    #[test]
    fn addresses_parse_as_hex_or_decimal() {
        assert_eq!(parse_addr("0x80_8000_0000"), Ok(0x80_8000_0000));
        assert_eq!(parse_addr("0X1000"), Ok(0x1000));
        assert_eq!(parse_addr("4096"), Ok(4096));
        assert!(parse_addr("0xzz").is_err());
    }

    #[test]
    fn arenas_hold_a_batch_and_the_query() {
        let cli = Cli::parse_from(["cxl-l2", "simulate", "--total", "10000", "--batch", "4096"]);
        let Cmd::Simulate { stream, .. } = cli.command else {
            panic!("expected simulate");
        };
        let cfg = stream.config();
        assert_eq!(cfg.device_pool, PoolId::Node(1));
        assert_eq!(stream.arena_bytes(&cfg).unwrap(), 4096 * 512 + PAGE_SIZE);
    }

    #[test]
    fn arenas_fit_a_query_wider_than_a_page() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        let query = dir.path().join("query.bin");
        std::fs::write(&base, vec![0u8; 4 * 2048 * 4]).unwrap();
        std::fs::write(&query, vec![0u8; 2048 * 4]).unwrap();

        let cli = Cli::parse_from([
            "cxl-l2",
            "simulate",
            "--base",
            base.to_str().unwrap(),
            "--query",
            query.to_str().unwrap(),
            "--total",
            "4",
            "--batch",
            "4",
            "--dim",
            "2048",
            "--poll-us",
            "0",
        ]);
        let Cmd::Simulate { stream, .. } = cli.command else {
            panic!("expected simulate");
        };
        let cfg = stream.config();
        assert_eq!(stream.arena_bytes(&cfg).unwrap(), 8 * PAGE_SIZE + 2 * PAGE_SIZE);

        let pools = simulated_pools(&stream, &cfg).unwrap();
        let report = run(SimulatedDevice::default(), pools, &cfg).unwrap();
        assert_eq!(report.total_vecs, 4);
    }

    #[test]
    fn silent_device_is_reported_as_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.bin");
        let query = dir.path().join("query.bin");
        std::fs::write(&base, vec![0u8; 8 * 128 * 4]).unwrap();
        std::fs::write(&query, vec![0u8; 128 * 4]).unwrap();

        let cli = Cli::parse_from([
            "cxl-l2",
            "simulate",
            "--base",
            base.to_str().unwrap(),
            "--query",
            query.to_str().unwrap(),
            "--total",
            "8",
            "--poll-us",
            "0",
            "--max-polls",
            "4",
        ]);
        let Cmd::Simulate { stream, .. } = cli.command else {
            panic!("expected simulate");
        };
        let cfg = stream.config();
        let pools = simulated_pools(&stream, &cfg).unwrap();
        let dev = SimulatedDevice::new(SimConfig::unresponsive());

        let err = run(dev, pools, &cfg).unwrap_err();
        assert!(err.to_string().contains("not responding"), "{err:#}");
        assert!(err.downcast_ref::<CxlError>().is_some_and(CxlError::is_device));
    }

    #[test]
    fn arena_override_applies_to_both_pools() {
        let cli = Cli::parse_from(["cxl-l2", "simulate", "--arena-mb", "3"]);
        let Cmd::Simulate { stream, .. } = cli.command else {
            panic!("expected simulate");
        };
        let cfg = stream.config();
        let pools = simulated_pools(&stream, &cfg).unwrap();
        assert_eq!(stream.arena_bytes(&cfg).unwrap(), 3 << 20);
        let host = pools.pool(PoolId::Host).unwrap().stats();
        assert_eq!(host.total_pages, (3 << 20) / PAGE_SIZE);
    }
}
