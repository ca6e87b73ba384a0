// src/arch/mod.rs
//! Architecture-specific definitions

pub mod riscv64;

pub use riscv64::{TrapFrame, REG_A0, REG_A1, REG_A2, REG_A3, REG_FP, REG_RA, REG_SP};
