//! Software model of the L2 engine's CSR handshake.
//!
//! Lets the streaming engine run end to end without the FPGA: CI, tests,
//! and dry runs of a configuration before touching hardware.
//!
//! The model reproduces the register-level behaviour the host relies on:
//!
//! - a 0→1 edge on `L2_START` (observed when its high word is written)
//!   latches `PAGE_ADDR0/1`, `NUM_REQ` and `ADDR_RANGE` as one launch;
//! - after `latency_polls` reads of `RESP` the completion bit is set,
//!   `DELAY` holds the cycle count and `RESP >> 1` the result payload;
//! - writing 0 to `L2_START` clears the completion bit.
//!
//! The cycle count is `overhead + ceil(vectors × dim / lanes)`. The result
//! payload is the number of vectors scanned. Distances are not computed.

use crate::error::Result;
use crate::mmio::{CsrMapper, RegisterIo};
use cxl_chip::regs::{response, start, Reg, CSR_WINDOW_SIZE};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Behaviour of the software device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// `RESP` reads before the completion bit appears
    pub latency_polls: u32,
    /// Distance lanes: samples consumed per cycle
    pub lanes: u32,
    /// Fixed cycles per launch
    pub overhead_cycles: u64,
    /// Launches that complete before the device stops responding (`None` = never hang)
    pub hang_after: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency_polls: 2,
            lanes: 16,
            overhead_cycles: 64,
            hang_after: None,
        }
    }
}

impl SimConfig {
    /// A device that never sets the completion bit.
    #[must_use]
    pub fn unresponsive() -> Self {
        Self {
            hang_after: Some(0),
            ..Self::default()
        }
    }

    /// Cycles the model reports for one launch.
    pub fn cycles_for(&self, vectors: u64, dimension: u64) -> u64 {
        let lanes = u64::from(self.lanes.max(1));
        self.overhead_cycles + (vectors * dimension).div_ceil(lanes)
    }
}

/// One 32-bit register write, in bus order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    /// Byte offset
    pub offset: usize,
    /// Written word
    pub value: u32,
}

/// Parameters latched by one start edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimLaunch {
    /// `PAGE_ADDR0`
    pub batch_addr: u64,
    /// `PAGE_ADDR1`
    pub query_addr: u64,
    /// `NUM_REQ`
    pub vectors: u64,
    /// `ADDR_RANGE`
    pub dimension: u64,
    /// `TEST_CASE`
    pub test_case: u64,
}

#[derive(Debug)]
struct SimState {
    words: Vec<u32>,
    journal: Vec<RegWrite>,
    launches: Vec<SimLaunch>,
    pending: Option<u32>,
    start_latched: u64,
    maps: usize,
    unmaps: usize,
}

impl SimState {
    fn reg(&self, reg: Reg) -> u64 {
        u64::from(self.words[reg.lo() / 4]) | (u64::from(self.words[reg.hi() / 4]) << 32)
    }

    fn set_reg(&mut self, reg: Reg, value: u64) {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.words[reg.lo() / 4] = value as u32;
            self.words[reg.hi() / 4] = (value >> 32) as u32;
        }
    }

    fn on_start(&mut self, cfg: &SimConfig) {
        let value = self.reg(Reg::Start);
        let prev = std::mem::replace(&mut self.start_latched, value);

        if value == start::IDLE {
            self.pending = None;
            let payload = response::payload(self.reg(Reg::Response));
            self.set_reg(Reg::Response, response::compose(false, payload));
            return;
        }
        if value != start::GO || prev != start::IDLE {
            return;
        }

        let launch = SimLaunch {
            batch_addr: self.reg(Reg::PageAddr0),
            query_addr: self.reg(Reg::PageAddr1),
            vectors: self.reg(Reg::NumRequests),
            dimension: self.reg(Reg::AddrRange),
            test_case: self.reg(Reg::TestCase),
        };
        let hang = cfg.hang_after.is_some_and(|n| self.launches.len() >= n);
        self.launches.push(launch);
        self.set_reg(Reg::Response, 0);
        self.pending = if hang { None } else { Some(cfg.latency_polls) };
        tracing::trace!("sim: launch {launch:?} (hang={hang})");
    }

    fn on_response_poll(&mut self, cfg: &SimConfig) {
        let Some(left) = self.pending else { return };
        if left > 0 {
            self.pending = Some(left - 1);
            return;
        }
        self.pending = None;
        if let Some(l) = self.launches.last().copied() {
            self.set_reg(Reg::Delay, cfg.cycles_for(l.vectors, l.dimension));
            self.set_reg(Reg::Response, response::compose(true, l.vectors));
        }
    }
}

/// Shared handle to a software device; maps to [`SimulatedCsr`] regions.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    cfg: SimConfig,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// New device in reset state.
    pub fn new(cfg: SimConfig) -> Self {
        Self {
            cfg,
            state: Arc::new(Mutex::new(SimState {
                words: vec![0; CSR_WINDOW_SIZE / 4],
                journal: Vec::new(),
                launches: Vec::new(),
                pending: None,
                start_latched: start::IDLE,
                maps: 0,
                unmaps: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Device behaviour.
    pub const fn config(&self) -> &SimConfig {
        &self.cfg
    }

    /// Every register write since creation.
    pub fn writes(&self) -> Vec<RegWrite> {
        self.state().journal.clone()
    }

    /// Every latched launch since creation.
    pub fn launches(&self) -> Vec<SimLaunch> {
        self.state().launches.clone()
    }

    /// Current value of a register.
    pub fn register(&self, reg: Reg) -> u64 {
        self.state().reg(reg)
    }

    /// Times the CSR block was mapped.
    pub fn maps(&self) -> usize {
        self.state().maps
    }

    /// Times a mapping was released.
    pub fn unmaps(&self) -> usize {
        self.state().unmaps
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl CsrMapper for SimulatedDevice {
    type Region = SimulatedCsr;

    fn map(&self) -> Result<SimulatedCsr> {
        self.state().maps += 1;
        tracing::debug!("sim: CSR mapped");
        Ok(SimulatedCsr {
            device: self.clone(),
        })
    }
}

/// Mapped view of a [`SimulatedDevice`].
#[derive(Debug)]
pub struct SimulatedCsr {
    device: SimulatedDevice,
}

impl RegisterIo for SimulatedCsr {
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the CSR block.
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= CSR_WINDOW_SIZE, "Register offset out of bounds");
        let cfg = self.device.cfg;
        let mut st = self.device.state();
        if offset == Reg::Response.lo() {
            st.on_response_poll(&cfg);
        }
        st.words[offset / 4]
    }

    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the CSR block.
    fn write32(&mut self, offset: usize, value: u32) {
        assert!(offset + 4 <= CSR_WINDOW_SIZE, "Register offset out of bounds");
        let cfg = self.device.cfg;
        let mut st = self.device.state();
        st.journal.push(RegWrite { offset, value });
        st.words[offset / 4] = value;
        if offset == Reg::Start.hi() {
            st.on_start(&cfg);
        }
    }
}

impl Drop for SimulatedCsr {
    fn drop(&mut self) {
        self.device.state().unmaps += 1;
        tracing::debug!("sim: CSR unmapped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::Csr;

    fn launch(csr: &mut Csr<SimulatedCsr>, vectors: u64) {
        csr.write(Reg::PageAddr0, 0x20_0000);
        csr.write(Reg::PageAddr1, 0x1000);
        csr.write(Reg::NumRequests, vectors);
        csr.write(Reg::AddrRange, 128);
        csr.write(Reg::TestCase, 100);
        csr.write(Reg::Start, 0);
        csr.write(Reg::Start, 1);
    }

    #[test]
    fn completes_after_latency_polls() {
        let dev = SimulatedDevice::new(SimConfig {
            latency_polls: 3,
            ..SimConfig::default()
        });
        let mut csr = Csr::new(dev.map().unwrap());
        launch(&mut csr, 4096);

        let polls = (1..=10)
            .find(|_| response::is_done(csr.read(Reg::Response)))
            .unwrap();
        assert_eq!(polls, 4);
        assert_eq!(response::payload(csr.read(Reg::Response)), 4096);
        assert_eq!(csr.read(Reg::Delay), 64 + 4096 * 128 / 16);

        let l = dev.launches()[0];
        assert_eq!(
            (l.batch_addr, l.query_addr, l.vectors, l.dimension, l.test_case),
            (0x20_0000, 0x1000, 4096, 128, 100)
        );
    }

    #[test]
    fn clearing_start_clears_done() {
        let dev = SimulatedDevice::new(SimConfig {
            latency_polls: 0,
            ..SimConfig::default()
        });
        let mut csr = Csr::new(dev.map().unwrap());
        launch(&mut csr, 8);
        assert!(response::is_done(csr.read(Reg::Response)));
        csr.write(Reg::Start, 0);
        assert!(!response::is_done(csr.read(Reg::Response)));
    }

    #[test]
    fn level_held_start_does_not_relaunch() {
        let dev = SimulatedDevice::default();
        let mut csr = Csr::new(dev.map().unwrap());
        launch(&mut csr, 8);
        csr.write(Reg::Start, 1);
        assert_eq!(dev.launches().len(), 1);
    }

    #[test]
    fn unresponsive_never_completes() {
        let dev = SimulatedDevice::new(SimConfig::unresponsive());
        let mut csr = Csr::new(dev.map().unwrap());
        launch(&mut csr, 8);
        assert!((0..1000).all(|_| !response::is_done(csr.read(Reg::Response))));
    }

    #[test]
    #[should_panic(expected = "Register offset out of bounds")]
    fn access_past_the_csr_block_panics() {
        let dev = SimulatedDevice::default();
        let csr = dev.map().unwrap();
        csr.read32(CSR_WINDOW_SIZE - 2);
    }

    #[test]
    fn mapping_is_counted() {
        let dev = SimulatedDevice::default();
        {
            let _a = dev.map().unwrap();
        }
        assert_eq!((dev.maps(), dev.unmaps()), (1, 1));
        assert!(dev.writes().is_empty());
    }
}
