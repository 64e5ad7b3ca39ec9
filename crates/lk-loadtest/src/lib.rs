//! Load testing for SFU rooms.
//!
//! A [`LoadTest`] plans a set of testers (publishers and subscribers), starts
//! them at a bounded rate, lets media flow for the test window and reduces
//! what every subscriber measured into a [`Report`]. The RTC stack sits
//! behind the [`rtc::Connector`] seam; [`loopback::LoopbackServer`] is the
//! in-process implementation.

pub mod config;
pub mod error;
pub mod layout;
pub mod limiter;
pub mod loadtest;
pub mod loopback;
pub mod media;
pub mod render;
pub mod rtc;
pub mod speaker;
pub mod stats;
pub mod suite;
pub mod tester;

pub use error::LoadTestError;
pub use layout::Layout;
pub use loadtest::{LoadTest, LoadTestParams, Report};
pub use loopback::{LoopbackConfig, LoopbackServer};
pub use suite::{SuiteReport, SUITE_CASES};
pub use tester::{LoadTester, TesterParams};
