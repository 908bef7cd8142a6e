use crate::runner::RunResult;

/// A crash worth handing to triage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugReport {
    /// The fuzzed input that triggered the crash.
    pub input: Vec<u8>,
    /// MD5 of the input, used for deduplication.
    pub input_hash: String,
    pub raw_code: u32,
    pub exception: &'static str,
}

impl BugReport {
    pub fn description(&self) -> String {
        format!("{} (0x{:08X})", self.exception, self.raw_code)
    }
}

/// Turns run results into bug reports.
pub trait Oracle {
    fn examine(&self, input: &[u8], result: &RunResult) -> Option<BugReport>;
}

/// Reports every run whose crash flag is set. Timeouts and hangs are not
/// reported.
#[derive(Debug, Default)]
pub struct CrashOracle;

impl CrashOracle {
    pub fn new() -> Self {
        CrashOracle
    }
}

impl Oracle for CrashOracle {
    fn examine(&self, input: &[u8], result: &RunResult) -> Option<BugReport> {
        if !result.crash {
            return None;
        }
        Some(BugReport {
            input: input.to_vec(),
            input_hash: format!("{:x}", md5::compute(input)),
            raw_code: result.raw_code,
            exception: result.exception.unwrap_or("UNKNOWN_EXCEPTION"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Outcome;
    use std::time::Duration;

    fn result(raw_code: u32, crash: bool, outcome: Outcome) -> RunResult {
        RunResult {
            raw_code,
            crash,
            exception: crash.then_some("STATUS_ACCESS_VIOLATION"),
            outcome,
            elapsed: Duration::from_millis(10),
        }
    }

    #[test]
    fn crash_oracle_reports_crashes() {
        let oracle = CrashOracle::new();
        let input = vec![0xFF, 0xFE, 0xFD];
        let report = oracle
            .examine(&input, &result(0xC000_0005, true, Outcome::ExitedNormal))
            .expect("crash should be reported");
        assert_eq!(report.input, input);
        assert_eq!(report.input_hash, format!("{:x}", md5::compute(&input)));
        assert_eq!(report.raw_code, 0xC000_0005);
        assert_eq!(
            report.description(),
            "STATUS_ACCESS_VIOLATION (0xC0000005)"
        );
    }

    #[test]
    fn crash_oracle_ignores_clean_exits() {
        let oracle = CrashOracle::new();
        assert!(
            oracle
                .examine(&[1, 2, 3], &result(0, false, Outcome::ExitedNormal))
                .is_none()
        );
    }

    #[test]
    fn crash_oracle_ignores_timeouts_and_hangs() {
        let oracle = CrashOracle::new();
        assert!(
            oracle
                .examine(&[0xAA], &result(137, false, Outcome::KilledTimeout))
                .is_none()
        );
        assert!(
            oracle
                .examine(&[0xAA], &result(137, false, Outcome::KilledHang))
                .is_none()
        );
    }
}
