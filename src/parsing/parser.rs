//! Sentinel-framed record extraction.
use crate::layout::{PhaseWrap, RecordLayout};
use crate::parsing::error::ParseError;
use crate::utils::constants::SENTINEL;
use crate::SignalSet;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type Result<T> = std::result::Result<T, ParseError>;

/// Why the record loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    EndOfFile,
    Cancelled,
}

/// Snapshot of a parse in progress.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Progress {
    pub percent: u8,
    pub anomaly_count: usize,
    pub complete_records: usize,
}

impl Progress {
    pub fn anomaly_rate(&self) -> f64 {
        anomaly_rate(self.anomaly_count, self.complete_records)
    }
}

pub(crate) fn anomaly_rate(anomalies: usize, complete: usize) -> f64 {
    let total = anomalies + complete;
    if total == 0 {
        0.0
    } else {
        anomalies as f64 / total as f64
    }
}

/// Cancellation flag and progress counters shared between a parse and its observers.
///
/// The parser is the only writer of the counters; the cancel flag has one writer and one reader.
#[derive(Debug)]
pub struct ParseControl {
    cancel: AtomicBool,
    record_limit: AtomicUsize,
    percent: AtomicUsize,
    anomalies: AtomicUsize,
    complete: AtomicUsize,
}

impl Default for ParseControl {
    fn default() -> Self {
        ParseControl {
            cancel: AtomicBool::new(false),
            record_limit: AtomicUsize::new(usize::MAX),
            percent: AtomicUsize::new(0),
            anomalies: AtomicUsize::new(0),
            complete: AtomicUsize::new(0),
        }
    }
}

impl ParseControl {
    pub fn new() -> ParseControl {
        ParseControl::default()
    }

    /// Requests the parse to stop at the next record boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Requests the parse to stop once `records` records are complete, as if cancelled there.
    pub fn cancel_after(&self, records: usize) {
        self.record_limit.store(records, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn limit_reached(&self, complete: usize) -> bool {
        complete >= self.record_limit.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> Progress {
        Progress {
            percent: self.percent.load(Ordering::Relaxed) as u8,
            anomaly_count: self.anomalies.load(Ordering::Relaxed),
            complete_records: self.complete.load(Ordering::Relaxed),
        }
    }

    /// Publishes the consumed share of the stream. Returns `true` when the integer percentage moved.
    fn publish(&self, consumed: usize, total: usize, complete: usize) -> bool {
        let percent = if total == 0 {
            100
        } else {
            (consumed.min(total) * 100) / total
        };
        self.complete.store(complete, Ordering::Relaxed);
        self.percent.swap(percent, Ordering::Relaxed) != percent
    }

    fn record_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of one parse. Every channel holds exactly `complete_records` values.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    pub channels: SignalSet,
    pub anomalies: Vec<usize>,
    pub complete_records: usize,
    /// Sample index of the first separator
    pub first_sentinel: usize,
    pub termination: Termination,
}

impl ParseOutcome {
    pub fn anomaly_rate(&self) -> f64 {
        anomaly_rate(self.anomalies.len(), self.complete_records)
    }

    pub fn is_complete(&self) -> bool {
        self.termination == Termination::EndOfFile
    }
}

/// Recovers fixed-width records from a sample stream using the separator at slot 0.
#[derive(Debug, Clone)]
pub struct FramedStreamParser {
    layout: RecordLayout,
}

impl FramedStreamParser {
    pub fn new(layout: RecordLayout) -> FramedStreamParser {
        FramedStreamParser { layout }
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    /// Extracts one value per named slot from every record whose successor separator sits where
    /// expected. Records that cannot be verified are skipped up to the next separator found and
    /// their distance is kept as an anomaly.
    ///
    /// # Errors
    /// Will return `Err` if the stream is not empty and contains no separator at all.
    pub fn parse(&self, samples: &[i16], control: &ParseControl) -> Result<ParseOutcome> {
        let total = samples.len();
        let width = self.layout.width();
        let scale = self.layout.scale();
        let slots: Vec<(usize, &str, Option<PhaseWrap>)> = self.layout.named_slots().collect();
        let mut columns: Vec<Vec<f64>> = slots
            .iter()
            .map(|_| Vec::with_capacity(total / width + 1))
            .collect();

        if total == 0 {
            control.publish(0, 0, 0);
            return Ok(ParseOutcome {
                channels: collect_channels(&slots, columns),
                anomalies: vec![],
                complete_records: 0,
                first_sentinel: 0,
                termination: Termination::EndOfFile,
            });
        }

        let first_sentinel =
            next_sentinel(samples, 0).ok_or(ParseError::NoSentinelFound(total))?;
        info!(
            "First separator found in position {}, record size {} (including the separator)",
            first_sentinel, width
        );

        let mut cursor = first_sentinel;
        let mut anomalies = vec![];
        let mut complete = 0;
        let mut termination = Termination::EndOfFile;

        loop {
            if control.is_cancelled() {
                termination = Termination::Cancelled;
                break;
            }
            let next = cursor + width;
            if next > total {
                break;
            }
            if control.limit_reached(complete) {
                debug!("Record limit reached at {} records", complete);
                termination = Termination::Cancelled;
                break;
            }
            // The last record of a capture has no successor separator
            if next == total || samples[next] == SENTINEL {
                for ((offset, _, wrap), column) in slots.iter().zip(columns.iter_mut()) {
                    let value = scale.apply(samples[cursor + offset]);
                    column.push(match wrap {
                        Some(wrap) => wrap.apply(value),
                        None => value,
                    });
                }
                complete += 1;
                cursor = next;
            } else {
                match next_sentinel(samples, cursor + 1) {
                    Some(found) => {
                        let distance = found - cursor;
                        debug!(
                            "Found an anomaly in {}: distance {} != {}",
                            cursor, distance, width
                        );
                        anomalies.push(distance);
                        control.record_anomaly();
                        cursor = found;
                    }
                    None => {
                        debug!("No separator after position {}, end of capture", cursor);
                        cursor = total;
                    }
                }
            }
            if control.publish(cursor, total, complete) {
                info!(
                    "Parsed {}% ({} of {} samples, {} anomalies)",
                    control.progress().percent,
                    cursor,
                    total,
                    anomalies.len()
                );
            }
        }
        control.publish(
            if termination == Termination::EndOfFile { total } else { cursor },
            total,
            complete,
        );

        if !anomalies.is_empty() {
            warn!(
                "Found {} anomalies over {} complete records (rate={:.4})",
                anomalies.len(),
                complete,
                anomaly_rate(anomalies.len(), complete)
            );
        }

        for ((_, name, _), column) in slots.iter().zip(columns.iter()) {
            debug_assert_eq!(column.len(), complete);
            if column.len() != complete {
                return Err(ParseError::Misaligned {
                    channel: name.to_string(),
                    len: column.len(),
                    records: complete,
                });
            }
        }

        Ok(ParseOutcome {
            channels: collect_channels(&slots, columns),
            anomalies,
            complete_records: complete,
            first_sentinel,
            termination,
        })
    }
}

fn next_sentinel(samples: &[i16], from: usize) -> Option<usize> {
    samples
        .get(from..)?
        .iter()
        .position(|&s| s == SENTINEL)
        .map(|p| p + from)
}

fn collect_channels(
    slots: &[(usize, &str, Option<PhaseWrap>)],
    columns: Vec<Vec<f64>>,
) -> SignalSet {
    slots
        .iter()
        .zip(columns)
        .map(|((_, name, _), column)| (name.to_string(), column))
        .collect()
}
