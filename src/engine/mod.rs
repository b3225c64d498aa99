//! Core engine: session control, the buy → settle → sell cycle and the
//! scheduler that drives it.

pub mod accountant;
pub mod controller;
pub mod runner;
pub mod scheduler;
