//! Background execution units: the refresh worker, the log poll
//! worker, and the pin-driven resurrection pass, each its own tokio task.

pub mod poll;
pub mod refresh;
pub mod resurrect;
