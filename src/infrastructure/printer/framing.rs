//! Terminator-delimited reassembly of inbound GATT notifications.

/// Accumulates bytes until the terminator shows up, then hands back the frame.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    terminator: u8,
}

impl FrameBuffer {
    pub fn new(terminator: u8) -> Self {
        Self {
            buf: Vec::new(),
            terminator,
        }
    }

    /// Append `chunk` and return every frame it completed, in order.
    ///
    /// Frames never include the terminator. A chunk may complete several frames.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte == self.terminator {
                frames.push(std::mem::take(&mut self.buf));
            } else {
                self.buf.push(byte);
            }
        }
        frames
    }

    /// Bytes received since the last terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut frames = FrameBuffer::new(0x0D);
        let out = frames.push(&[0x41, 0x42, 0x0D, 0x43, 0x44, 0x0D]);
        assert_eq!(out, vec![b"AB".to_vec(), b"CD".to_vec()]);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut frames = FrameBuffer::new(0x0D);
        assert!(frames.push(b"HEL").is_empty());
        assert_eq!(frames.pending(), b"HEL");
        assert!(frames.push(b"LO").is_empty());
        assert_eq!(frames.push(b"\rWO"), vec![b"HELLO".to_vec()]);
        assert_eq!(frames.pending(), b"WO");
    }

    #[test]
    fn test_bare_terminator_yields_empty_frame() {
        let mut frames = FrameBuffer::new(0x0D);
        assert_eq!(frames.push(&[0x0D]), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_clear_drops_partial_frame() {
        let mut frames = FrameBuffer::new(b'\n');
        frames.push(b"partial");
        frames.clear();
        assert_eq!(frames.push(b"x\n"), vec![b"x".to_vec()]);
    }
}
