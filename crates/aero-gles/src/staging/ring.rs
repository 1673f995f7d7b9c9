use std::fmt;

use crate::backend::{BufferBackend, BufferHandle, BufferUsageHint, SubmissionId};
use crate::error::{BackendError, StagingError};

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// Linear sub-allocator over `[base, base + capacity)`. Tracks offsets only.
#[derive(Clone)]
struct Segment {
    base: u64,
    capacity: u64,
    cursor: u64,
    /// Latest submission that references memory in this segment.
    last_used: SubmissionId,
    /// Bumped every time the segment is recycled.
    epoch: u64,
}

impl Segment {
    fn new(base: u64, capacity: u64) -> Self {
        Self {
            base,
            capacity,
            cursor: base,
            last_used: SubmissionId::NONE,
            epoch: 0,
        }
    }

    fn reset(&mut self) {
        self.cursor = self.base;
        self.epoch += 1;
    }

    fn end(&self) -> u64 {
        self.base + self.capacity
    }

    fn remaining(&self) -> u64 {
        self.end().saturating_sub(self.cursor)
    }

    fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let aligned = align_up(self.cursor, alignment.max(1));
        let end = aligned.checked_add(size)?;
        if end > self.end() {
            return None;
        }
        self.cursor = end;
        Some(aligned)
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .field("last_used", &self.last_used.0)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// A sub-range handed out by [`RingAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAllocation {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
    segment: usize,
    epoch: u64,
}

/// Transient scratch memory for per-draw data (default-block uniforms, streaming buffers).
///
/// One backend buffer is split into `frames_in_flight` segments. Allocations bump through the
/// current segment; when it is full the ring moves to the next segment, but only once every
/// submission that used that segment has completed. Nothing is ever overwritten while the GPU
/// may still read it.
pub struct RingAllocator {
    buffer: Option<BufferHandle>,
    segments: Vec<Segment>,
    current: usize,
}

impl RingAllocator {
    pub fn new(segment_size: u64, segments: u32) -> Self {
        let segment_size = align_up(segment_size.max(1), 256);
        Self {
            buffer: None,
            segments: (0..u64::from(segments.max(1)))
                .map(|i| Segment::new(i * segment_size, segment_size))
                .collect(),
            current: 0,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.capacity).sum()
    }

    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    /// Reserves `size` bytes at `alignment` for `submission`.
    pub fn alloc<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        size: u64,
        alignment: u64,
        submission: SubmissionId,
        completed: SubmissionId,
    ) -> Result<RingAllocation, StagingError> {
        let buffer = match self.buffer {
            Some(buffer) => buffer,
            None => {
                let total = self.total_size();
                let buffer = backend
                    .allocate_buffer(total, BufferUsageHint::ANY_DRAW)
                    .map_err(|err| match err {
                        BackendError::OutOfMemory { requested } => {
                            StagingError::OutOfMemory { requested }
                        }
                        other => StagingError::Backend(other),
                    })?;
                self.buffer = Some(buffer);
                buffer
            }
        };

        let size = align_up(size.max(1), 4);
        if let Some(offset) = self.segments[self.current].alloc(size, alignment) {
            return Ok(self.commit(buffer, offset, size, submission));
        }

        let next = (self.current + 1) % self.segments.len();
        if self.segments[next].last_used > completed {
            return Err(StagingError::RingOutOfSpace {
                requested: size,
                remaining: self.segments[self.current].remaining(),
            });
        }
        let segment = &mut self.segments[next];
        segment.reset();
        match segment.alloc(size, alignment) {
            Some(offset) => {
                self.current = next;
                Ok(self.commit(buffer, offset, size, submission))
            }
            None => Err(StagingError::RingOutOfSpace {
                requested: size,
                remaining: segment.remaining(),
            }),
        }
    }

    fn commit(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        submission: SubmissionId,
    ) -> RingAllocation {
        let segment = &mut self.segments[self.current];
        segment.last_used = segment.last_used.max(submission);
        RingAllocation {
            buffer,
            offset,
            size,
            segment: self.current,
            epoch: segment.epoch,
        }
    }

    /// Extends the lifetime of an earlier allocation to `submission`. Returns `false` if its
    /// segment has been recycled since, in which case the contents are gone.
    pub fn retain(&mut self, allocation: &RingAllocation, submission: SubmissionId) -> bool {
        if self.buffer != Some(allocation.buffer) {
            return false;
        }
        match self.segments.get_mut(allocation.segment) {
            Some(segment) if segment.epoch == allocation.epoch => {
                segment.last_used = segment.last_used.max(submission);
                true
            }
            _ => false,
        }
    }

    /// Allocates and fills ring space with `data`, zero-padded to four bytes.
    pub fn upload<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        data: &[u8],
        alignment: u64,
        submission: SubmissionId,
        completed: SubmissionId,
    ) -> Result<RingAllocation, StagingError> {
        let allocation = self.alloc(backend, data.len() as u64, alignment, submission, completed)?;
        let padded = padded_bytes(data);
        backend.write_buffer(allocation.buffer, allocation.offset, &padded)?;
        Ok(allocation)
    }

    pub fn destroy<B: BufferBackend + ?Sized>(&mut self, backend: &mut B) {
        if let Some(buffer) = self.buffer.take() {
            backend.free_buffer(buffer);
        }
    }
}

impl fmt::Debug for RingAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingAllocator")
            .field("buffer", &self.buffer)
            .field("current", &self.current)
            .field("segments", &self.segments)
            .finish()
    }
}

/// `data` padded with zeroes to a multiple of four bytes (at least four).
pub(crate) fn padded_bytes(data: &[u8]) -> Vec<u8> {
    let len = align_up((data.len() as u64).max(1), 4) as usize;
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(data);
    out.resize(len, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Buffers {
        allocated: Vec<u64>,
        writes: Vec<(u64, usize)>,
    }

    impl BufferBackend for Buffers {
        fn allocate_buffer(
            &mut self,
            size: u64,
            _usage: BufferUsageHint,
        ) -> Result<BufferHandle, BackendError> {
            self.allocated.push(size);
            Ok(BufferHandle(self.allocated.len() as u64))
        }

        fn write_buffer(
            &mut self,
            _handle: BufferHandle,
            offset: u64,
            data: &[u8],
        ) -> Result<(), BackendError> {
            self.writes.push((offset, data.len()));
            Ok(())
        }

        fn free_buffer(&mut self, _handle: BufferHandle) {}
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(u64::MAX, 256), u64::MAX / 256 * 256);
    }

    #[test]
    fn allocations_bump_within_a_segment() {
        let mut backend = Buffers::default();
        let mut ring = RingAllocator::new(1024, 3);
        let s1 = SubmissionId(1);

        let a = ring.alloc(&mut backend, 10, 4, s1, SubmissionId::NONE).unwrap();
        let b = ring.alloc(&mut backend, 16, 256, s1, SubmissionId::NONE).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(a.size, 12);
        assert_eq!(b.offset, 256);
        assert_eq!(backend.allocated, vec![3 * 1024]);
    }

    #[test]
    fn full_segment_advances_only_after_completion() {
        let mut backend = Buffers::default();
        let mut ring = RingAllocator::new(256, 2);

        ring.alloc(&mut backend, 256, 4, SubmissionId(1), SubmissionId::NONE)
            .unwrap();
        // Segment 1 was never used, so advancing is safe.
        let second = ring
            .alloc(&mut backend, 256, 4, SubmissionId(2), SubmissionId::NONE)
            .unwrap();
        assert_eq!(second.offset, 256);

        // Wrapping back to segment 0 needs submission 1 to be complete.
        let err = ring
            .alloc(&mut backend, 4, 4, SubmissionId(3), SubmissionId::NONE)
            .unwrap_err();
        assert!(matches!(err, StagingError::RingOutOfSpace { requested: 4, .. }));

        let wrapped = ring
            .alloc(&mut backend, 4, 4, SubmissionId(3), SubmissionId(1))
            .unwrap();
        assert_eq!(wrapped.offset, 0);
    }

    #[test]
    fn oversized_requests_fail() {
        let mut backend = Buffers::default();
        let mut ring = RingAllocator::new(256, 2);
        let err = ring
            .alloc(&mut backend, 1024, 4, SubmissionId(1), SubmissionId::NONE)
            .unwrap_err();
        assert!(matches!(err, StagingError::RingOutOfSpace { .. }));
    }

    #[test]
    fn retained_allocations_pin_their_segment() {
        let mut backend = Buffers::default();
        let mut ring = RingAllocator::new(256, 2);

        let first = ring
            .alloc(&mut backend, 256, 4, SubmissionId(1), SubmissionId::NONE)
            .unwrap();
        ring.alloc(&mut backend, 256, 4, SubmissionId(2), SubmissionId::NONE)
            .unwrap();
        assert!(ring.retain(&first, SubmissionId(3)));

        // Submission 1 is done but the retained use by 3 still pins segment 0.
        assert!(ring
            .alloc(&mut backend, 4, 4, SubmissionId(4), SubmissionId(2))
            .is_err());

        ring.alloc(&mut backend, 4, 4, SubmissionId(4), SubmissionId(3))
            .unwrap();
        assert!(!ring.retain(&first, SubmissionId(5)));
    }

    #[test]
    fn uploads_are_padded() {
        let mut backend = Buffers::default();
        let mut ring = RingAllocator::new(256, 1);
        ring.upload(&mut backend, &[1, 2, 3], 4, SubmissionId(1), SubmissionId::NONE)
            .unwrap();
        assert_eq!(backend.writes, vec![(0, 4)]);
        assert_eq!(padded_bytes(&[]), vec![0; 4]);
    }
}
