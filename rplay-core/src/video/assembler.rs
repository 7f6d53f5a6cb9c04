//! Fragment reassembly.
//!
//! Only the frame currently being received is buffered. Real-time video
//! prefers freshness over completeness: the first fragment of a newer
//! frame discards whatever is left of the current one, and fragments of
//! frames already completed or discarded are dropped on arrival.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::transport::VideoFragment;

/// Upper bound on the payload of a single frame.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

// ── CompletedFrame ───────────────────────────────────────────────

/// All fragments of one frame, in fragment order.
#[derive(Debug, Clone)]
pub struct CompletedFrame {
    pub frame_index: u32,
    pub fragments: Vec<Bytes>,
}

impl CompletedFrame {
    pub fn len(&self) -> usize {
        self.fragments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parts(&self) -> impl Iterator<Item = &[u8]> {
        self.fragments.iter().map(|b| b.as_ref())
    }
}

// ── Stats ────────────────────────────────────────────────────────

/// Counters kept by the [`FrameAssembler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub fragments: u64,
    pub dropped_fragments: u64,
    pub discarded_frames: u64,
    pub completed_frames: u64,
}

// ── FrameAssembler ───────────────────────────────────────────────

#[derive(Debug)]
struct PartialFrame {
    frame_index: u32,
    fragments: Vec<Option<Bytes>>,
    received: usize,
    bytes: usize,
}

impl PartialFrame {
    fn new(frame_index: u32, count: u16) -> Self {
        Self {
            frame_index,
            fragments: vec![None; count as usize],
            received: 0,
            bytes: 0,
        }
    }
}

/// Reassembles frames from their fragments.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    current: Option<PartialFrame>,
    /// Highest frame index that was completed or discarded.
    retired: Option<u32>,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Index of the frame being assembled, if any.
    pub fn current_frame(&self) -> Option<u32> {
        self.current.as_ref().map(|c| c.frame_index)
    }

    /// Feed one fragment. Returns the frame it completes, if any.
    pub fn push(&mut self, fragment: VideoFragment) -> Option<CompletedFrame> {
        self.stats.fragments += 1;

        if fragment.fragment_count == 0 || fragment.fragment_index >= fragment.fragment_count {
            trace!(
                frame = fragment.frame_index,
                index = fragment.fragment_index,
                count = fragment.fragment_count,
                "malformed fragment"
            );
            return self.drop_fragment();
        }

        if self.retired.is_some_and(|last| fragment.frame_index <= last) {
            trace!(frame = fragment.frame_index, "stale fragment");
            return self.drop_fragment();
        }

        match self.current_frame() {
            Some(current) if fragment.frame_index < current => {
                trace!(frame = fragment.frame_index, current, "stale fragment");
                return self.drop_fragment();
            }
            Some(current) if fragment.frame_index > current => {
                self.discard_current("superseded");
            }
            _ => {}
        }

        let current = self
            .current
            .get_or_insert_with(|| PartialFrame::new(fragment.frame_index, fragment.fragment_count));

        if current.fragments.len() != fragment.fragment_count as usize {
            trace!(frame = fragment.frame_index, "fragment count mismatch");
            return self.drop_fragment();
        }

        let idx = fragment.fragment_index as usize;
        if current.fragments[idx].is_some() {
            return self.drop_fragment();
        }

        if current.bytes + fragment.payload.len() > MAX_FRAME_SIZE {
            self.discard_current("oversized");
            return None;
        }

        current.bytes += fragment.payload.len();
        current.fragments[idx] = Some(fragment.payload);
        current.received += 1;

        if current.received < current.fragments.len() {
            return None;
        }

        let done = self.current.take()?;
        self.retire(done.frame_index);
        self.stats.completed_frames += 1;
        Some(CompletedFrame {
            frame_index: done.frame_index,
            fragments: done.fragments.into_iter().flatten().collect(),
        })
    }

    fn drop_fragment(&mut self) -> Option<CompletedFrame> {
        self.stats.dropped_fragments += 1;
        None
    }

    fn retire(&mut self, frame_index: u32) {
        self.retired = Some(self.retired.map_or(frame_index, |last| last.max(frame_index)));
    }

    fn discard_current(&mut self, why: &'static str) {
        if let Some(partial) = self.current.take() {
            self.retire(partial.frame_index);
            self.stats.discarded_frames += 1;
            debug!(
                frame = partial.frame_index,
                received = partial.received,
                expected = partial.fragments.len(),
                why,
                "discarding incomplete frame"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(frame: u32, index: u16, count: u16, data: &[u8]) -> VideoFragment {
        VideoFragment {
            frame_index: frame,
            fragment_index: index,
            fragment_count: count,
            payload: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn assembles_out_of_order_fragments() {
        let mut asm = FrameAssembler::new();
        assert!(asm.push(frag(1, 2, 3, b"c")).is_none());
        assert!(asm.push(frag(1, 0, 3, b"a")).is_none());
        let done = asm.push(frag(1, 1, 3, b"b")).unwrap();
        assert_eq!(done.frame_index, 1);
        let bytes: Vec<u8> = done.parts().flatten().copied().collect();
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn newer_frame_discards_incomplete_one() {
        let mut asm = FrameAssembler::new();
        assert!(asm.push(frag(1, 0, 1, b"x")).is_some());
        assert!(asm.push(frag(2, 0, 2, b"y")).is_none());
        assert_eq!(asm.current_frame(), Some(2));

        let done = asm.push(frag(3, 0, 1, b"z")).unwrap();
        assert_eq!(done.frame_index, 3);
        assert_eq!(asm.stats().discarded_frames, 1);

        // The rest of frame 2 is now stale.
        assert!(asm.push(frag(2, 1, 2, b"y")).is_none());
        assert_eq!(asm.stats().dropped_fragments, 1);
    }

    #[test]
    fn drops_duplicates_and_malformed() {
        let mut asm = FrameAssembler::new();
        assert!(asm.push(frag(5, 0, 2, b"a")).is_none());
        assert!(asm.push(frag(5, 0, 2, b"a")).is_none());
        assert!(asm.push(frag(5, 2, 2, b"?")).is_none());
        assert!(asm.push(frag(5, 0, 0, b"?")).is_none());
        assert!(asm.push(frag(5, 1, 3, b"?")).is_none());
        assert_eq!(asm.stats().dropped_fragments, 4);
        assert!(asm.push(frag(5, 1, 2, b"b")).is_some());
    }

    #[test]
    fn oversized_frame_is_discarded() {
        let mut asm = FrameAssembler::new();
        let big = vec![0u8; MAX_FRAME_SIZE];
        assert!(asm.push(frag(1, 0, 2, &big)).is_none());
        assert!(asm.push(frag(1, 1, 2, b"!")).is_none());
        assert_eq!(asm.stats().discarded_frames, 1);
        assert_eq!(asm.current_frame(), None);
    }

    #[test]
    fn rest_of_oversized_frame_is_stale() {
        let mut asm = FrameAssembler::new();
        let big = vec![0u8; MAX_FRAME_SIZE];
        assert!(asm.push(frag(4, 0, 3, &big)).is_none());
        assert!(asm.push(frag(4, 1, 3, b"!")).is_none());
        assert!(asm.push(frag(4, 2, 3, b"?")).is_none());

        assert_eq!(asm.current_frame(), None);
        let stats = asm.stats();
        assert_eq!(stats.discarded_frames, 1);
        assert_eq!(stats.dropped_fragments, 1);

        let done = asm.push(frag(5, 0, 1, b"next")).unwrap();
        assert_eq!(done.frame_index, 5);
    }
}
