/// Fixed matrix of scenarios run back to back against one server.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::LoadTestError;
use crate::loadtest::{parse_url, run_scenario, LoadTest, LoadTestParams, Report};
use crate::render;

/// Window per case when the base scenario has no duration.
pub const SUITE_CASE_DURATION: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuiteCase {
    pub video_publishers: u32,
    pub audio_publishers: u32,
    pub subscribers: u32,
}

const fn case(video_publishers: u32, audio_publishers: u32, subscribers: u32) -> SuiteCase {
    SuiteCase {
        video_publishers,
        audio_publishers,
        subscribers,
    }
}

pub const SUITE_CASES: [SuiteCase; 6] = [
    case(1, 0, 1),
    case(0, 5, 10),
    case(0, 10, 50),
    case(1, 0, 50),
    case(5, 5, 20),
    case(10, 0, 10),
];

impl SuiteCase {
    /// Base scenario with this case's counts. Each case gets its own room.
    pub fn apply(&self, base: &LoadTestParams, index: usize) -> LoadTestParams {
        let mut params = base.clone();
        params.video_publishers = self.video_publishers;
        params.audio_publishers = self.audio_publishers;
        params.subscribers = self.subscribers;
        if !base.room.is_empty() {
            params.room = format!("{}_{index}", base.room);
        }
        if params.duration.is_zero() {
            params.duration = SUITE_CASE_DURATION;
        }
        params
    }

    fn publishers(&self) -> u32 {
        self.video_publishers.max(self.audio_publishers)
    }
}

/// One line of the suite matrix.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteRow {
    pub case: SuiteCase,
    pub publishers: u32,
    pub subscribers: u32,
    /// Remote tracks subscribed across all testers
    pub tracks: usize,
    pub audio: bool,
    pub video: bool,
    pub loss_rate: f64,
    pub errors: usize,
    /// Set when the case never ran, e.g. it failed preflight
    pub failure: Option<String>,
}

impl SuiteRow {
    pub fn from_report(case: SuiteCase, report: &Report) -> Self {
        Self {
            case,
            publishers: case.publishers(),
            subscribers: case.subscribers,
            tracks: report.totals.tracks,
            audio: case.audio_publishers > 0,
            video: case.video_publishers > 0,
            loss_rate: report.totals.loss_rate(),
            errors: report.totals.errors,
            failure: None,
        }
    }

    pub fn failed(case: SuiteCase, error: &LoadTestError) -> Self {
        Self {
            case,
            publishers: case.publishers(),
            subscribers: case.subscribers,
            tracks: 0,
            audio: case.audio_publishers > 0,
            video: case.video_publishers > 0,
            loss_rate: 0.0,
            errors: 0,
            failure: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub rows: Vec<SuiteRow>,
    /// Reports of the cases that ran, in order
    pub reports: Vec<Report>,
}

impl SuiteReport {
    pub fn render(&self) -> String {
        render::suite_table(&self.rows).render()
    }
}

impl LoadTest {
    /// Run every case of [`SUITE_CASES`] using this test's parameters as the base.
    pub async fn run_suite(&self) -> Result<SuiteReport, LoadTestError> {
        self.run_cases(&SUITE_CASES).await
    }

    /// Cases run sequentially. A case that fails becomes a row; only a bad
    /// URL or cancellation before the first case ends the suite with an error.
    pub async fn run_cases(&self, cases: &[SuiteCase]) -> Result<SuiteReport, LoadTestError> {
        parse_url(&self.params.url)?;

        let mut suite = SuiteReport {
            rows: Vec::with_capacity(cases.len()),
            reports: Vec::new(),
        };
        for (index, case) in cases.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let params = case.apply(&self.params, index);
            info!(
                case = index,
                video_publishers = case.video_publishers,
                audio_publishers = case.audio_publishers,
                subscribers = case.subscribers,
                "suite case starting"
            );
            match run_scenario(params, &self.connector, &self.cancel).await {
                Ok(report) => {
                    suite.rows.push(SuiteRow::from_report(*case, &report));
                    suite.reports.push(report);
                }
                Err(e) => {
                    warn!(case = index, error = %e, "suite case failed");
                    suite.rows.push(SuiteRow::failed(*case, &e));
                }
            }
        }

        if suite.rows.is_empty() && self.cancel.is_cancelled() {
            return Err(LoadTestError::Cancelled);
        }
        Ok(suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_overrides_counts_and_room() {
        let base = LoadTestParams {
            room: "bench".into(),
            video_publishers: 3,
            ..Default::default()
        };
        let p = SUITE_CASES[1].apply(&base, 1);
        assert_eq!((p.video_publishers, p.audio_publishers, p.subscribers), (0, 5, 10));
        assert_eq!(p.room, "bench_1");
        assert_eq!(p.duration, SUITE_CASE_DURATION);

        let timed = LoadTestParams {
            duration: Duration::from_secs(2),
            ..Default::default()
        };
        let p = SUITE_CASES[0].apply(&timed, 0);
        assert!(p.room.is_empty());
        assert_eq!(p.duration, Duration::from_secs(2));
    }

    #[test]
    fn failed_row_keeps_case_shape() {
        let err = LoadTestError::CloudLimitExceeded {
            role: "subscriber",
            count: 51,
            limit: 50,
        };
        let row = SuiteRow::failed(SUITE_CASES[4], &err);
        assert_eq!((row.publishers, row.subscribers), (5, 20));
        assert!(row.audio && row.video);
        assert!(row.failure.as_deref().unwrap_or_default().contains("subscriber"));
    }
}
