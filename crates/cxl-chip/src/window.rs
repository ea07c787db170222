//! CXL memory window and host-physical → device-physical translation.
//!
//! The accelerator addresses its attached memory with device physical
//! addresses (DPA). The host sees the same memory through a window in its
//! physical address map starting at `base`, exposed as its own NUMA node.
//! For an allocation that landed in that node, `dpa = pa - base`.
//!
//! When the allocation did not come from the CXL node, when no base is
//! configured, or when the address lies below the base, the host address is
//! passed through unchanged and the caller is told why.

/// Base of the CXL window on the reference host.
pub const TYPICAL_BASE: u64 = 0x80_8000_0000;

/// NUMA node the CXL window is onlined as on the reference host.
pub const TYPICAL_NODE: u32 = 1;

/// CXL window placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CxlWindow {
    base: u64,
    node: u32,
}

/// Why an address was passed through untranslated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Passthrough {
    /// The allocation came from a pool other than the CXL node.
    OutsideNode,
    /// No window base configured (zero).
    BaseUnset,
    /// Address lies below the window base.
    BelowBase,
}

impl std::fmt::Display for Passthrough {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutsideNode => write!(f, "allocation is not on the CXL node"),
            Self::BaseUnset => write!(f, "CXL window base not configured"),
            Self::BelowBase => write!(f, "address below CXL window base"),
        }
    }
}

/// Result of translating one host physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// Device physical address inside the window.
    Device(u64),
    /// Raw host address used as a best-effort fallback.
    Passthrough {
        /// The untouched host physical address.
        addr: u64,
        /// Why translation was not applied.
        reason: Passthrough,
    },
}

impl Translation {
    /// Address to program into the device, translated or not.
    #[must_use]
    pub const fn address(&self) -> u64 {
        match *self {
            Self::Device(a) | Self::Passthrough { addr: a, .. } => a,
        }
    }

    /// Whether the window offset was applied.
    #[must_use]
    pub const fn is_translated(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

/// Translate `pa` for an allocation whose pool is (`in_window`) or is not the CXL node.
#[must_use]
pub const fn translate(pa: u64, base: u64, in_window: bool) -> Translation {
    let reason = if !in_window {
        Passthrough::OutsideNode
    } else if base == 0 {
        Passthrough::BaseUnset
    } else if pa < base {
        Passthrough::BelowBase
    } else {
        return Translation::Device(pa - base);
    };
    Translation::Passthrough { addr: pa, reason }
}

impl CxlWindow {
    /// Window at `base`, onlined as NUMA node `node`.
    #[must_use]
    pub const fn new(base: u64, node: u32) -> Self {
        Self { base, node }
    }

    /// Window base (host physical).
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// NUMA node id of the window.
    #[must_use]
    pub const fn node(&self) -> u32 {
        self.node
    }

    /// Translate an address allocated from NUMA node `node` (`None` = default host pool).
    #[must_use]
    pub const fn translate(&self, pa: u64, node: Option<u32>) -> Translation {
        let in_window = match node {
            Some(n) => n == self.node,
            None => false,
        };
        translate(pa, self.base, in_window)
    }
}

impl Default for CxlWindow {
    fn default() -> Self {
        Self::new(TYPICAL_BASE, TYPICAL_NODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn above_base_subtracts() {
        let t = translate(TYPICAL_BASE + 0x20_0000, TYPICAL_BASE, true);
        assert_eq!(t, Translation::Device(0x20_0000));
        assert!(t.is_translated());
        assert_eq!(translate(TYPICAL_BASE, TYPICAL_BASE, true).address(), 0);
    }

    #[test]
    fn below_base_passes_through() {
        let t = translate(0x1000, TYPICAL_BASE, true);
        assert_eq!(
            t,
            Translation::Passthrough {
                addr: 0x1000,
                reason: Passthrough::BelowBase
            }
        );
        assert_eq!(t.address(), 0x1000);
    }

    #[test]
    fn unset_base_and_foreign_pool_pass_through() {
        assert!(matches!(
            translate(0x9000, 0, true),
            Translation::Passthrough { reason: Passthrough::BaseUnset, .. }
        ));
        assert!(matches!(
            translate(TYPICAL_BASE + 4096, TYPICAL_BASE, false),
            Translation::Passthrough { reason: Passthrough::OutsideNode, .. }
        ));
    }

    #[test]
    fn window_matches_node() {
        let w = CxlWindow::new(0x4000_0000, 2);
        assert_eq!(w.translate(0x4000_1000, Some(2)).address(), 0x1000);
        assert!(!w.translate(0x4000_1000, Some(0)).is_translated());
        assert!(!w.translate(0x4000_1000, None).is_translated());
    }
}
