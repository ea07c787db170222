//! CSR register map of the L2 distance engine (FPGA BAR1).
//!
//! Every register is a 64-bit logical quantity. The host bus used to reach
//! the BAR is 32 bits wide, so each register is accessed as two little-endian
//! halves: low word at `offset`, high word at `offset + 4`.
//!
//! ```text
//! 0x0000  FUNC_TYPE     function-type selector (legacy cache/IO micro-ops)
//! 0x0008  PAGE_ADDR0    device address of the base-vector batch
//! 0x0010  PAGE_ADDR1    device address of the query vector
//! 0x0018  DELAY         delay count in, L2 cycle count out (test case 100)
//! 0x0020  TEST_CASE     micro-op selector; 100 = L2 streaming
//! 0x0028  RESP          bit 0 = done, bits 63..1 = result payload
//! 0x0060  NUM_REQ       vectors in this batch
//! 0x0068  ADDR_RANGE    vector dimension
//! 0x0070  L2_START      start trigger (edge: 0 then 1)
//! 0x00E0  BAR_ADDR      BAR address scratch
//! ```

// ── Window geometry ──────────────────────────────────────────────────────────

/// Bytes of BAR1 covered by the CSR block.
pub const CSR_WINDOW_SIZE: usize = 0x1000;

/// Physical address of BAR1 on the reference host (bus 0x43).
pub const TYPICAL_CSR_PHYS: u64 = 0x20be_ffa0_0000;

// ── Registers ────────────────────────────────────────────────────────────────

/// A named 64-bit control/status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Reg {
    /// Function-type selector.
    FuncType = 0x0000,
    /// Page address 0: base-vector batch.
    PageAddr0 = 0x0008,
    /// Page address 1: query vector.
    PageAddr1 = 0x0010,
    /// Delay in, cycle count out.
    Delay = 0x0018,
    /// Test-case selector.
    TestCase = 0x0020,
    /// Response / status.
    Response = 0x0028,
    /// Number of vectors in the batch.
    NumRequests = 0x0060,
    /// Address range, used as the vector dimension.
    AddrRange = 0x0068,
    /// Start trigger.
    Start = 0x0070,
    /// BAR address scratch.
    BarAddr = 0x00E0,
}

impl Reg {
    /// Every register, in offset order.
    pub const ALL: [Self; 10] = [
        Self::FuncType,
        Self::PageAddr0,
        Self::PageAddr1,
        Self::Delay,
        Self::TestCase,
        Self::Response,
        Self::NumRequests,
        Self::AddrRange,
        Self::Start,
        Self::BarAddr,
    ];

    /// Byte offset of the register inside the CSR window.
    #[must_use]
    pub const fn offset(self) -> usize {
        self as usize
    }

    /// Offset of the low 32-bit half.
    #[must_use]
    pub const fn lo(self) -> usize {
        self.offset()
    }

    /// Offset of the high 32-bit half.
    #[must_use]
    pub const fn hi(self) -> usize {
        self.offset() + 4
    }

    /// Look up the register whose low or high half lives at `offset`.
    #[must_use]
    pub fn from_offset(offset: usize) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.lo() == offset || r.hi() == offset)
    }

    /// Short upper-case name, as printed in register dumps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FuncType => "FUNC_TYPE",
            Self::PageAddr0 => "PAGE_ADDR0",
            Self::PageAddr1 => "PAGE_ADDR1",
            Self::Delay => "DELAY",
            Self::TestCase => "TEST_CASE",
            Self::Response => "RESP",
            Self::NumRequests => "NUM_REQ",
            Self::AddrRange => "ADDR_RANGE",
            Self::Start => "L2_START",
            Self::BarAddr => "BAR_ADDR",
        }
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:#06x}", self.name(), self.offset())
    }
}

// ── Field values ─────────────────────────────────────────────────────────────

/// `TEST_CASE` selector values.
pub mod test_case {
    /// L2 streaming; the wrapper muxes `DELAY` to the L2 cycle counter.
    pub const L2_STREAM: u64 = 100;
}

/// `L2_START` values.
pub mod start {
    /// Trigger released.
    pub const IDLE: u64 = 0;
    /// Trigger asserted; the engine latches on the 0→1 edge.
    pub const GO: u64 = 1;
}

/// `RESP` layout.
pub mod response {
    /// Completion flag.
    pub const DONE: u64 = 1 << 0;
    /// Result payload starts above the completion flag.
    pub const PAYLOAD_SHIFT: u32 = 1;

    /// Whether the completion flag is set.
    #[must_use]
    pub const fn is_done(resp: u64) -> bool {
        resp & DONE != 0
    }

    /// Result payload carried in the upper bits.
    #[must_use]
    pub const fn payload(resp: u64) -> u64 {
        resp >> PAYLOAD_SHIFT
    }

    /// Compose a response word (used by the software device model).
    #[must_use]
    pub const fn compose(done: bool, payload: u64) -> u64 {
        (payload << PAYLOAD_SHIFT) | if done { DONE } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_match_reference_layout() {
        assert_eq!(Reg::PageAddr0.offset(), 0x08);
        assert_eq!(Reg::Delay.offset(), 0x18);
        assert_eq!(Reg::Response.offset(), 0x28);
        assert_eq!(Reg::NumRequests.offset(), 0x60);
        assert_eq!(Reg::Start.offset(), 0x70);
        // 29th 64-bit slot
        assert_eq!(Reg::BarAddr.offset(), 28 * 8);
    }

    #[test]
    fn registers_do_not_overlap_and_fit_window() {
        for (i, a) in Reg::ALL.iter().enumerate() {
            assert_eq!(a.offset() % 8, 0, "{a} not 8-byte aligned");
            assert!(a.hi() + 4 <= CSR_WINDOW_SIZE);
            for b in &Reg::ALL[i + 1..] {
                assert!(a.offset() < b.offset(), "{a} and {b} out of order");
            }
        }
    }

    #[test]
    fn halves_resolve_back_to_register() {
        for reg in Reg::ALL {
            assert_eq!(Reg::from_offset(reg.lo()), Some(reg));
            assert_eq!(Reg::from_offset(reg.hi()), Some(reg));
        }
        assert_eq!(Reg::from_offset(0x30), None);
    }

    #[test]
    fn response_payload_sits_above_done_bit() {
        let resp = response::compose(true, 1808);
        assert!(response::is_done(resp));
        assert_eq!(response::payload(resp), 1808);
        assert!(!response::is_done(response::compose(false, 7)));
    }
}
