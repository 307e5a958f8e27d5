//! Newline-delimited JSON signal intake.
//!
//! Each line is `{"pattern_detected": bool, "payload": {...}}`. A missing
//! `pattern_detected` means low priority. Blank lines are ignored.

use digit_core::Signal;
use digit_pipeline::{PushOutcome, SignalQueue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct SignalLine {
    #[serde(default)]
    pattern_detected: bool,
    payload: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeStats {
    pub accepted: u64,
    pub displaced: u64,
    pub rejected: u64,
    pub malformed: u64,
}

/// Push every line of `reader` into `queue` until EOF or `cancel`.
pub async fn read_signals<R>(reader: R, queue: &SignalQueue, cancel: &CancellationToken) -> IntakeStats
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = IntakeStats::default();

    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Signal intake read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let parsed: SignalLine = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                stats.malformed += 1;
                warn!(error = %e, "Skipping malformed signal line");
                continue;
            }
        };

        let signal = Signal::new(parsed.pattern_detected, parsed.payload);
        let signal_id = signal.signal_id.clone();
        match queue.push(signal) {
            PushOutcome::Accepted => {
                stats.accepted += 1;
                debug!(signal_id = %signal_id, "Signal queued");
            }
            PushOutcome::Displaced(evicted) => {
                stats.accepted += 1;
                stats.displaced += 1;
                debug!(signal_id = %signal_id, evicted = %evicted.signal_id, "Signal queued, oldest low-priority evicted");
            }
            PushOutcome::Rejected(reason) => {
                stats.rejected += 1;
                info!(signal_id = %signal_id, ?reason, "Signal skipped");
            }
        }
    }

    info!(?stats, "Signal intake finished");
    stats
}
