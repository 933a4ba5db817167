use crate::layout::LayoutError;
use thiserror::Error;

/// Errors raised while turning a capture file into raw channels.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Could not read capture file: {0}")]
    Io(#[from] std::io::Error),

    /// Format error: the stream never contains the record separator
    #[error("No record separator found in {0} samples")]
    NoSentinelFound(usize),

    /// Channel lengths diverged from the number of complete records
    #[error("Channel '{channel}' holds {len} values but {records} records were complete")]
    Misaligned {
        channel: String,
        len: usize,
        records: usize,
    },

    #[error("{0}")]
    Layout(#[from] LayoutError),

    /// Channels were requested before the parse finished
    #[error("Parse is {0}, channels are not ready")]
    NotReady(String),

    #[error("Parse was already started")]
    AlreadyStarted,

    #[error("Parse worker failed: {0}")]
    Worker(String),
}
