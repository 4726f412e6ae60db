//! Core utilities shared by every stage

pub mod time;

pub use time::{Clock, ManualClock, Millis, SystemClock};
