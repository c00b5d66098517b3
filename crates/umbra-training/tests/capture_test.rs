//! In-process capture redirects the real stdout/stderr descriptors. The test
//! harness reports results on the same descriptors, so this binary holds a
//! single test.

#![cfg(unix)]

use std::io::Write;
use umbra_training::capture::capture;
use umbra_training::{LineSplit, TrainingError};

#[tokio::test]
async fn test_capture_merges_output_and_reports_result() {
    let job = capture(LineSplit::Newline, || {
        let mut out = std::io::stdout();
        out.write_all(b"1: 2.0, 2.0 avg loss\n")?;
        out.flush()?;
        let mut err = std::io::stderr();
        err.write_all(b"warning from stderr\n")?;
        out.write_all(b"unterminated")?;
        out.flush()?;
        Ok(())
    })
    .unwrap();

    let lines = job.run_to_end().await.unwrap();
    assert_eq!(lines, ["1: 2.0, 2.0 avg loss", "warning from stderr", "unterminated"]);

    let job = capture(LineSplit::Newline, || {
        std::io::stdout().write_all(b"before failure\n")?;
        Err(TrainingError::InvalidRequest("bad".to_string()))
    })
    .unwrap();

    let lines = job.lines.collect().await.unwrap();
    assert_eq!(lines, ["before failure"]);
    assert!(matches!(job.completion.wait().await, Err(TrainingError::InvalidRequest(_))));
}
