//! Padded frame buffers and the pool they are recycled through.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// Zeroed bytes appended after every frame so a decoder may read past
/// the end of the bitstream safely.
pub const VIDEO_BUFFER_PADDING_SIZE: usize = 64;

/// Default number of buffers in a [`FramePool`].
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Accepted pool sizes.
pub const POOL_SIZE_RANGE: std::ops::RangeInclusive<usize> = 2..=8;

// ── VideoFrame ───────────────────────────────────────────────────

/// One assembled frame, handed to the video callback by reference.
///
/// The buffer holds `len()` bytes of frame data followed by
/// [`VIDEO_BUFFER_PADDING_SIZE`] zero bytes.
#[derive(Debug)]
pub struct VideoFrame {
    buf: Vec<u8>,
    size: usize,
    sequence: u32,
    frames_lost: u32,
    recovered: bool,
    width: u32,
    height: u32,
}

impl VideoFrame {
    /// Fill `buf` with the concatenation of `parts` plus padding.
    ///
    /// `buf` keeps its capacity, so a recycled buffer does not
    /// reallocate once it has grown to the stream's frame size.
    pub fn assemble<'a, I>(
        mut buf: Vec<u8>,
        parts: I,
        sequence: u32,
        frames_lost: u32,
        recovered: bool,
    ) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        buf.clear();
        for part in parts {
            buf.extend_from_slice(part);
        }
        let size = buf.len();
        buf.resize(size + VIDEO_BUFFER_PADDING_SIZE, 0);
        Self {
            buf,
            size,
            sequence,
            frames_lost,
            recovered,
            width: 0,
            height: 0,
        }
    }

    /// Tag the frame with the stream's negotiated resolution.
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Frame bytes, padding excluded.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    /// Frame bytes followed by the zeroed padding region.
    pub fn padded(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Frame index assigned by the host; strictly increasing across
    /// delivered frames.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Frames dropped between the previous delivered frame and this one.
    pub fn frames_lost(&self) -> u32 {
        self.frames_lost
    }

    /// This frame is the first delivered after a loss.
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    /// Negotiated stream width in pixels, 0 if unknown.
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub(crate) fn into_buffer(self) -> Vec<u8> {
        self.buf
    }
}

// ── FramePool ────────────────────────────────────────────────────

/// Fixed set of reusable frame buffers, handed out round-robin.
#[derive(Debug, Clone)]
pub struct FramePool {
    free: Arc<Mutex<VecDeque<Vec<u8>>>>,
    capacity: usize,
}

impl FramePool {
    /// `capacity` is clamped to [`POOL_SIZE_RANGE`].
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(*POOL_SIZE_RANGE.start(), *POOL_SIZE_RANGE.end());
        let free = (0..capacity).map(|_| Vec::new()).collect();
        Self {
            free: Arc::new(Mutex::new(free)),
            capacity,
        }
    }

    /// Take a free buffer, or `None` if every buffer is in use.
    pub fn acquire(&self) -> Option<Vec<u8>> {
        self.free.lock().pop_front()
    }

    /// Return a buffer to the back of the queue.
    pub fn release(&self, buf: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push_back(buf);
        }
    }

    pub fn recycle(&self, frame: VideoFrame) {
        self.release(frame.into_buffer());
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_is_zeroed_and_excluded() {
        let dirty = vec![0xFF; 300];
        let frame = VideoFrame::assemble(dirty, [&b"abc"[..], &b"de"[..]], 7, 0, false);
        assert_eq!(frame.data(), b"abcde");
        assert_eq!(frame.len(), 5);
        assert_eq!(frame.padded().len(), 5 + VIDEO_BUFFER_PADDING_SIZE);
        assert!(frame.padded()[5..].iter().all(|&b| b == 0));
        assert_eq!(frame.sequence(), 7);
    }

    #[test]
    fn pool_exhausts_and_recycles() {
        let pool = FramePool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        pool.release(a);
        assert_eq!(pool.available(), 1);
        let frame = VideoFrame::assemble(b, [&[1u8, 2, 3][..]], 1, 0, false);
        pool.recycle(frame);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn recycled_buffer_keeps_capacity() {
        let pool = FramePool::new(2);
        let buf = pool.acquire().unwrap();
        let frame = VideoFrame::assemble(buf, [&[0u8; 4096][..]], 1, 0, false);
        pool.recycle(frame);
        pool.acquire().unwrap();
        let reused = pool.acquire().unwrap();
        assert!(reused.capacity() >= 4096);
    }

    #[test]
    fn pool_size_is_clamped() {
        assert_eq!(FramePool::new(0).capacity(), 2);
        assert_eq!(FramePool::new(100).capacity(), 8);
    }
}
