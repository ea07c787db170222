//! Silicon model for the CXL L2 distance accelerator.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what the FPGA expects from the host: the CSR register map,
//! the placement of the CXL memory window, and the Q16.16 number format the
//! distance datapath consumes.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | CSR block (BAR1): register offsets, trigger and response fields |
//! | [`window`] | CXL window constants, host PA → device PA translation |
//! | [`fixed`] | binary32 → Q16.16 conversion without floating-point arithmetic |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod fixed;
pub mod regs;
pub mod window;
