pub mod agu;
pub mod branch_predictor;
pub mod branch_tables;
pub mod breakpoint;
pub mod circular;
pub mod common;
pub mod cpu;
pub mod decode_instr;
pub mod executable;
pub mod gshare;
pub mod hash_table;
pub mod instr;
pub mod io;
pub mod memory;
pub mod pipeline;
pub mod reg_file;
pub mod register;
pub mod sim;

#[cfg(feature = "stat")]
pub mod stat;
