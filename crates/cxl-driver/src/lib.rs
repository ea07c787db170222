//! Host driver for L2-distance offload to a CXL-attached accelerator.
//!
//! The accelerator reads a converted query vector and a converted batch of
//! base vectors from CXL memory and reports how many cycles the squared-L2
//! scan took. This crate streams a corpus that does not fit device memory
//! through it batch by batch.
//!
//! # Pipeline
//!
//! ```text
//! VectorFile ──▶ staging (PoolId::Host) ──Q16.16──▶ destination (PoolId::Node)
//!                                                        │ device address
//!                                                        ▼
//!                    LaunchDriver ── PAGE_ADDR0/1, NUM_REQ, ADDR_RANGE, L2_START ──▶ CSR (BAR1)
//!                         │
//!                         ▼ cycles per batch
//!                    StreamReport ──▶ FileSink / LogSink
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use cxl_driver::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let host = PagePool::new(PoolId::Host, Arena::anonymous(4 << 20, 0)?);
//! let cxl = Arena::map_device(std::path::Path::new("/dev/dax0.0"), 64 << 20, 0, None)?;
//! let pools = PoolSet::new(host).with_device(PagePool::new(PoolId::Node(1), cxl));
//!
//! let csr = CsrSource::Physical { addr: 0x20be_ffa0_0000, len: 0x1000 };
//! let mut engine = StreamEngine::new(csr, pools).with_sink(LogSink);
//!
//! let report = engine.run(&StreamConfig::default())?;
//! print!("{report}");
//! # Ok(())
//! # }
//! ```
//!
//! Without hardware, [`SimulatedDevice`] stands in for the CSR block.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod corpus;
pub mod engine;
mod error;
pub mod fvecs;
pub mod launch;
pub mod memory;
pub mod mmio;
pub mod report;
pub mod sim;

pub use corpus::{CorpusShape, VectorFile};
pub use engine::{BatchPlan, StreamConfig, StreamEngine};
pub use error::{CxlError, Result};
pub use fvecs::{convert_fvecs, FvecsSummary};
pub use launch::{BatchLaunch, BatchOutcome, CancelToken, LaunchDriver, LaunchState, PollConfig};
pub use memory::{Arena, ContigBuffer, PagePool, PoolId, PoolSet, PoolStats, PAGE_SIZE};
pub use mmio::{Csr, CsrMapper, CsrSource, MappedRegion, RegisterIo};
pub use report::{
    deliver_all, BatchProgress, FileSink, LogSink, PassRecord, ReportFields, ReportSink,
    StreamReport,
};
pub use sim::{SimConfig, SimulatedCsr, SimulatedDevice};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Arena, CancelToken, CsrSource, CxlError, FileSink, LogSink, PagePool, PollConfig, PoolId,
        PoolSet, Result, SimConfig, SimulatedDevice, StreamConfig, StreamEngine, StreamReport,
    };
}
