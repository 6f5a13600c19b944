//! Outbound payload splitting to the endpoint's packet size.

use crate::domain::error::Result;
use crate::domain::settings::FinalChunkPolicy;
use std::time::Duration;
use tracing::debug;

/// A sink that accepts one bulk transfer at a time.
pub trait BulkOut {
    fn bulk_transfer(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;
}

/// Split `payload` into transfers of `chunk_size` bytes.
///
/// Payloads that fit in one chunk (or a zero chunk size) go out whole.
/// Otherwise chunk `i` covers `[i * chunk_size, (i + 1) * chunk_size)`; under
/// [`FinalChunkPolicy::Padded`] the tail is zero-filled to a full chunk.
pub fn plan_chunks(payload: &[u8], chunk_size: usize, policy: FinalChunkPolicy) -> Vec<Vec<u8>> {
    if chunk_size == 0 || payload.len() <= chunk_size {
        return vec![payload.to_vec()];
    }

    payload
        .chunks(chunk_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            if policy == FinalChunkPolicy::Padded {
                chunk.resize(chunk_size, 0);
            }
            chunk
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkedWriter {
    chunk_size: usize,
    policy: FinalChunkPolicy,
    timeout: Duration,
}

impl ChunkedWriter {
    pub fn new(chunk_size: usize, policy: FinalChunkPolicy, timeout: Duration) -> Self {
        Self {
            chunk_size,
            policy,
            timeout,
        }
    }

    /// Send every chunk in order, stopping at the first failed transfer.
    /// Returns the number of transfers issued.
    pub fn write(&self, out: &mut dyn BulkOut, payload: &[u8]) -> Result<usize> {
        let chunks = plan_chunks(payload, self.chunk_size, self.policy);
        for chunk in &chunks {
            let sent = out.bulk_transfer(chunk, self.timeout)?;
            if sent < chunk.len() {
                debug!("Short bulk transfer: {} of {} bytes", sent, chunk.len());
            }
        }
        Ok(chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::LinkError;

    #[derive(Default)]
    struct Recorder {
        transfers: Vec<Vec<u8>>,
        fail_at: Option<usize>,
    }

    impl BulkOut for Recorder {
        fn bulk_transfer(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
            if self.fail_at == Some(self.transfers.len()) {
                return Err(LinkError::IoFailure("stall".to_string()));
            }
            self.transfers.push(data.to_vec());
            Ok(data.len())
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    #[test]
    fn test_small_payload_single_transfer() {
        let chunks = plan_chunks(&payload(10), 64, FinalChunkPolicy::Padded);
        assert_eq!(chunks, vec![payload(10)]);

        let exact = plan_chunks(&payload(64), 64, FinalChunkPolicy::Padded);
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn test_chunk_count_and_reassembly() {
        for policy in [FinalChunkPolicy::Padded, FinalChunkPolicy::Short] {
            for (len, size) in [(65, 64), (128, 64), (1000, 64), (513, 512), (7, 3)] {
                let p = payload(len);
                let chunks = plan_chunks(&p, size, policy);
                assert_eq!(chunks.len(), len.div_ceil(size));

                let mut joined: Vec<u8> = chunks.concat();
                joined.truncate(len);
                assert_eq!(joined, p);
            }
        }
    }

    #[test]
    fn test_padded_tail_is_zero_filled() {
        let chunks = plan_chunks(&[1, 2, 3, 4, 5], 2, FinalChunkPolicy::Padded);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5, 0]]);
    }

    #[test]
    fn test_short_tail_keeps_remainder() {
        let chunks = plan_chunks(&[1, 2, 3, 4, 5], 2, FinalChunkPolicy::Short);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_zero_chunk_size_sends_whole_payload() {
        let chunks = plan_chunks(&payload(300), 0, FinalChunkPolicy::Padded);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_writer_stops_on_failure() {
        let writer = ChunkedWriter::new(4, FinalChunkPolicy::Short, Duration::from_secs(1));
        let mut out = Recorder {
            fail_at: Some(1),
            ..Default::default()
        };
        let result = writer.write(&mut out, &payload(12));
        assert!(matches!(result, Err(LinkError::IoFailure(_))));
        assert_eq!(out.transfers.len(), 1);
    }

    #[test]
    fn test_writer_reports_transfer_count() {
        let writer = ChunkedWriter::new(4, FinalChunkPolicy::Padded, Duration::from_secs(1));
        let mut out = Recorder::default();
        assert_eq!(writer.write(&mut out, &payload(9)).unwrap(), 3);
        assert!(out.transfers.iter().all(|t| t.len() == 4));
    }
}
