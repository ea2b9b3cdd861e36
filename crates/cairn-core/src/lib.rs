//! Core types shared by the cairn overlay: node identity, the sealed frame
//! format, the nested-list persistence codec, and configuration.

pub mod config;
pub mod identity;
pub mod netlist;
pub mod wire;
