use crate::parsing::error::ParseError;
use log::{info, warn};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// The complete contents of a capture file, as 16-bit samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleStream {
    samples: Vec<i16>,
}

impl SampleStream {
    pub fn new(samples: Vec<i16>) -> SampleStream {
        SampleStream { samples }
    }

    /// Interprets `bytes` as host-endian `i16` samples. A trailing odd byte is dropped.
    pub fn from_bytes(bytes: &[u8]) -> SampleStream {
        let chunks = bytes.chunks_exact(2);
        if !chunks.remainder().is_empty() {
            warn!(
                "Capture holds {} bytes, ignoring the trailing odd byte",
                bytes.len()
            );
        }
        let samples = chunks
            .map(bytemuck::pod_read_unaligned::<i16>)
            .collect();
        SampleStream { samples }
    }

    /// Buffers everything `data` yields before converting it. Files are better read with
    /// [`open`](Self::open), which needs no intermediate byte buffer.
    pub fn read(mut data: impl Read) -> Result<SampleStream, ParseError> {
        let mut buffer: Vec<u8> = vec![];
        data.read_to_end(&mut buffer)?;
        Ok(SampleStream::from_bytes(&buffer))
    }

    /// Reads a capture file straight into its sample buffer.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SampleStream, ParseError> {
        let mut file = File::open(path.as_ref())?;
        let bytes = file.metadata()?.len() as usize;
        let mut samples = vec![0i16; bytes / 2];
        file.read_exact(bytemuck::cast_slice_mut(samples.as_mut_slice()))?;
        if bytes % 2 != 0 {
            warn!(
                "Capture holds {} bytes, ignoring the trailing odd byte",
                bytes
            );
        }
        info!(
            "Read {}, found {} samples",
            path.as_ref().display(),
            samples.len()
        );
        Ok(SampleStream { samples })
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl From<Vec<i16>> for SampleStream {
    fn from(samples: Vec<i16>) -> Self {
        SampleStream::new(samples)
    }
}
