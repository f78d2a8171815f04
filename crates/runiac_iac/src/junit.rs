//! JUnit XML reports for step test runs.
//!
//! Test binaries print Go-style verbose output (`--- PASS: TestName (0.01s)`).
//! Each result line becomes a test case; output without any result lines is
//! reported as a single case named after the suite.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use runiac_runner::StepTestOutput;

use crate::error::IacResult;

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failed,
    Skipped,
}

/// A parsed test case.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub outcome: CaseOutcome,
    pub seconds: f64,
}

fn result_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*--- (PASS|FAIL|SKIP): (\S+) \(([0-9.]+)s\)").expect("valid regex")
    })
}

/// Extract test cases from verbose test output.
pub fn parse_test_cases(output: &str) -> Vec<TestCase> {
    output
        .lines()
        .filter_map(|line| result_re().captures(line))
        .map(|caps| TestCase {
            name: caps[2].to_string(),
            outcome: match &caps[1] {
                "PASS" => CaseOutcome::Passed,
                "FAIL" => CaseOutcome::Failed,
                _ => CaseOutcome::Skipped,
            },
            seconds: caps[3].parse().unwrap_or(0.0),
        })
        .collect()
}

/// Escape markup and drop characters XML 1.0 does not allow.
fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '\t' | '\n' | '\r' => escaped.push(c),
            c if c < '\u{20}' || c == '\u{FFFE}' || c == '\u{FFFF}' => {}
            c => escaped.push(c),
        }
    }
    escaped
}

/// Render a JUnit document for one suite.
pub fn render_report(suite: &str, output: &StepTestOutput, duration: Duration) -> String {
    let mut cases = parse_test_cases(&output.stream_output);
    if cases.is_empty() {
        cases.push(TestCase {
            name: suite.to_string(),
            outcome: if output.passed() {
                CaseOutcome::Passed
            } else {
                CaseOutcome::Failed
            },
            seconds: duration.as_secs_f64(),
        });
    }

    let failures = cases.iter().filter(|c| c.outcome == CaseOutcome::Failed).count();
    let skipped = cases.iter().filter(|c| c.outcome == CaseOutcome::Skipped).count();
    let failure_message = output.error.as_deref().unwrap_or("test failed");

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuites>\n");
    xml.push_str(&format!(
        "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" time=\"{:.3}\">\n",
        escape(suite),
        cases.len(),
        failures,
        skipped,
        duration.as_secs_f64()
    ));
    for case in &cases {
        xml.push_str(&format!(
            "    <testcase classname=\"{}\" name=\"{}\" time=\"{:.3}\"",
            escape(suite),
            escape(&case.name),
            case.seconds
        ));
        match case.outcome {
            CaseOutcome::Passed => xml.push_str("/>\n"),
            CaseOutcome::Failed => xml.push_str(&format!(
                ">\n      <failure message=\"{}\"/>\n    </testcase>\n",
                escape(failure_message)
            )),
            CaseOutcome::Skipped => xml.push_str(">\n      <skipped/>\n    </testcase>\n"),
        }
    }
    xml.push_str(&format!(
        "    <system-out>{}</system-out>\n  </testsuite>\n</testsuites>\n",
        escape(&output.stream_output)
    ));
    xml
}

/// Write the report to `path`, creating parent directories.
pub fn write_report(path: &Path, suite: &str, output: &StepTestOutput, duration: Duration) -> IacResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render_report(suite, output, duration))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_go_verbose_output() {
        let output = "=== RUN   TestBucket\n--- PASS: TestBucket (0.12s)\n=== RUN   TestPolicy\n    --- FAIL: TestPolicy (1.50s)\n--- SKIP: TestSlow (0.00s)\nFAIL\n";
        let cases = parse_test_cases(output);
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[0].outcome, CaseOutcome::Passed);
        assert_eq!(cases[1].name, "TestPolicy");
        assert_eq!(cases[1].outcome, CaseOutcome::Failed);
        assert_eq!(cases[2].outcome, CaseOutcome::Skipped);
    }

    #[test]
    fn test_render_without_cases_uses_suite() {
        let output = StepTestOutput {
            stream_output: "exit status 1 <bad>".to_string(),
            error: Some("exit code 1".to_string()),
        };
        let xml = render_report("runiac-core-iam-primary-us-east-1", &output, Duration::from_secs(2));
        assert!(xml.contains("tests=\"1\" failures=\"1\""));
        assert!(xml.contains("<failure message=\"exit code 1\"/>"));
        assert!(xml.contains("&lt;bad&gt;"));
    }

    #[test]
    fn test_control_characters_are_dropped() {
        let output = StepTestOutput {
            stream_output: "\u{1b}[32m--- PASS: TestVpc (0.01s)\u{1b}[0m\n\tok\u{7}\r\n".to_string(),
            error: None,
        };
        let xml = render_report("suite", &output, Duration::ZERO);
        assert!(!xml.contains('\u{1b}'));
        assert!(!xml.contains('\u{7}'));
        assert!(xml.contains("[32m--- PASS: TestVpc (0.01s)[0m\n\tok\r\n"));
    }

    #[test]
    fn test_write_report_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junit").join("suite.xml");
        write_report(&path, "suite", &StepTestOutput::default(), Duration::ZERO).unwrap();
        let xml = fs::read_to_string(&path).unwrap();
        assert!(xml.contains("failures=\"0\""));
    }
}
