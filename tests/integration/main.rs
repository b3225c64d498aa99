//! Integration tests: the full service wired over in-memory fakes.

mod cycle_flow;
mod fakes;
