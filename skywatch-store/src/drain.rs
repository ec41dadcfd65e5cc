//! JSON-lines input adapter.
//!
//! Each line is either a bare detection message or an envelope carrying the
//! observer's own position alongside it:
//!
//! ```text
//! {"uid": "SN1", "lat": 35.1, "lon": -82.3, "rssi": -61}
//! {"message": {"uid": "FPV", "rssi": -48, "isShortRangeDetection": true},
//!  "observer": {"latitude": 35.0, "longitude": -82.0}}
//! ```
//!
//! Reading blocks, so `drain` must run on a blocking thread. `drain_until`
//! does that and also owns the engine's final flush.

use std::future::Future;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Deserialize;

use skywatch_core::message::{DetectionMessage, ObserverStatus};

use crate::engine::EngineHandle;
use crate::error::{Result, StoreError};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Line {
    Envelope {
        message: DetectionMessage,
        #[serde(default)]
        observer: Option<ObserverStatus>,
    },
    Bare(DetectionMessage),
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Option<serde_json::Result<(DetectionMessage, Option<ObserverStatus>)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str::<Line>(line).map(|parsed| match parsed {
        Line::Envelope { message, observer } => (message, observer),
        Line::Bare(message) => (message, None),
    }))
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DrainReport {
    pub accepted: usize,
    pub skipped: usize,
}

/// Feed every line of `reader` to the engine until EOF or `stop` is set.
///
/// Bytes that are not UTF-8 are replaced, so a garbled line is skipped like
/// any other unparseable one. Only a failing read or a stopped engine ends
/// the drain early.
pub fn drain(mut reader: impl BufRead, handle: &EngineHandle, stop: &AtomicBool) -> Result<DrainReport> {
    let mut report = DrainReport::default();
    let mut buf = Vec::new();
    let mut n = 0usize;
    loop {
        if stop.load(Ordering::Relaxed) {
            info!("input stopped after {n} lines");
            break;
        }
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        n += 1;
        let line = String::from_utf8_lossy(&buf);
        match parse_line(&line) {
            None => {}
            Some(Ok((message, observer))) => {
                handle.blocking_ingest(message, observer)?;
                report.accepted += 1;
            }
            Some(Err(e)) => {
                warn!("line {n}: skipping unparseable message: {e}");
                report.skipped += 1;
            }
        }
    }
    debug!("drained {} messages, {} skipped", report.accepted, report.skipped);
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrainOutcome {
    /// Input reached EOF.
    Finished(DrainReport),
    /// `interrupt` fired first. The reader thread may still be blocked.
    Interrupted,
}

/// Drain `reader` on a blocking thread until EOF or until `interrupt`
/// resolves, then shut the engine down.
///
/// The final flush runs on every path, including a failed read, so queued
/// writes are never dropped. A flush failure takes precedence over a read
/// failure.
pub async fn drain_until<R, F>(reader: R, handle: &EngineHandle, interrupt: F) -> Result<DrainOutcome>
where
    R: BufRead + Send + 'static,
    F: Future<Output = ()>,
{
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let h = handle.clone();
    let reader_task = tokio::task::spawn_blocking(move || drain(reader, &h, &flag));

    let outcome = tokio::select! {
        joined = reader_task => match joined {
            Ok(result) => result.map(DrainOutcome::Finished),
            Err(e) => Err(StoreError::Io(io::Error::other(e))),
        },
        _ = interrupt => {
            info!("interrupted, abandoning input");
            stop.store(true, Ordering::Relaxed);
            Ok(DrainOutcome::Interrupted)
        }
    };

    let flushed = handle.shutdown().await;
    if let (Err(read_err), Err(_)) = (&outcome, &flushed) {
        error!("input failed before the final flush: {read_err}");
    }
    flushed?;
    outcome
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
