//! Tracking Context
//!
//! The tracking context records which sources a computation reads. This
//! enables automatic dependency tracking: a computed node opens a frame,
//! runs its function, closes the frame and subscribes to everything that
//! was read in between.
//!
//! # Implementation
//!
//! The context owns a stack of frames. Entering a computation pushes a frame;
//! completing it pops the frame and hands back the recorded [`ReadSet`]. Only
//! the top frame records, so a nested computation (a computed node reading
//! another computed node) never leaks its reads into the outer frame.
//!
//! The context is an ordinary value rather than a thread-local. Every cell
//! and node holds a clone, and tests build their own context so no frame
//! state leaks between them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::subscriber::{Source, SourceId};
use crate::error::{Error, Result};

/// Identifier of a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u64);

impl FrameId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The sources read while a frame was active, in first-read order.
#[derive(Default, Clone)]
pub struct ReadSet {
    sources: IndexMap<SourceId, Arc<dyn Source>>,
}

impl ReadSet {
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.sources.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.sources.keys().copied()
    }

    pub fn remove(&mut self, id: SourceId) -> Option<Arc<dyn Source>> {
        self.sources.shift_remove(&id)
    }

    pub(crate) fn into_sources(self) -> IndexMap<SourceId, Arc<dyn Source>> {
        self.sources
    }
}

impl std::fmt::Debug for ReadSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.sources.keys()).finish()
    }
}

/// An entry in the frame stack.
struct Frame {
    id: FrameId,
    /// Untracked frames swallow reads instead of recording them.
    recording: bool,
    reads: ReadSet,
}

/// Records which sources are read during a computation.
///
/// Cloning yields another handle to the same frame stack.
#[derive(Clone, Default)]
pub struct TrackingContext {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl TrackingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a fresh, empty, recording frame.
    pub fn begin_frame(&self) -> FrameId {
        self.push(true)
    }

    fn push(&self, recording: bool) -> FrameId {
        let id = FrameId::new();
        let mut frames = self.frames.lock();
        frames.push(Frame {
            id,
            recording,
            reads: ReadSet::default(),
        });
        tracing::trace!(frame = id.0, depth = frames.len(), recording, "frame pushed");
        id
    }

    /// Pop the frame `id` and return everything read while it was active.
    ///
    /// Fails with [`Error::FrameMismatch`] if `id` is not the top frame; the
    /// stack is left untouched in that case.
    pub fn end_frame(&self, id: FrameId) -> Result<ReadSet> {
        let mut frames = self.frames.lock();
        match frames.last() {
            Some(top) if top.id == id => {}
            top => {
                return Err(Error::FrameMismatch {
                    expected: id.0,
                    found: top.map(|frame| frame.id.0),
                })
            }
        }
        let frame = frames.pop().map(|frame| frame.reads).unwrap_or_default();
        tracing::trace!(frame = id.0, reads = frame.len(), "frame popped");
        Ok(frame)
    }

    /// Record a read of `source` in the active frame.
    ///
    /// No-op when no frame is active or the top frame is untracked.
    pub fn track<S>(&self, source: &Arc<S>)
    where
        S: Source + 'static,
    {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.last_mut() {
            if frame.recording {
                frame
                    .reads
                    .sources
                    .entry(source.source_id())
                    .or_insert_with(|| Arc::clone(source) as Arc<dyn Source>);
            }
        }
    }

    /// Open a recording frame that is popped when the guard drops.
    pub fn scope(&self) -> TrackingScope {
        TrackingScope {
            context: self.clone(),
            id: self.begin_frame(),
            ended: false,
        }
    }

    /// Run `f` inside a recording frame and return its result with the reads.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> (R, ReadSet) {
        let scope = self.scope();
        let result = f();
        (result, scope.finish())
    }

    /// Run `f` without attributing its reads to the enclosing computation.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = TrackingScope {
            context: self.clone(),
            id: self.push(false),
            ended: false,
        };
        f()
    }

    /// Whether a read right now would be recorded.
    pub fn is_tracking(&self) -> bool {
        self.frames
            .lock()
            .last()
            .map(|frame| frame.recording)
            .unwrap_or(false)
    }

    /// Number of frames on the stack.
    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }
}

impl std::fmt::Debug for TrackingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingContext")
            .field("depth", &self.depth())
            .finish()
    }
}

/// Guard that pops its frame when dropped.
///
/// This keeps the frame stack balanced even if the computation panics.
pub struct TrackingScope {
    context: TrackingContext,
    id: FrameId,
    ended: bool,
}

impl TrackingScope {
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Pop the frame and return its reads.
    pub fn finish(mut self) -> ReadSet {
        self.ended = true;
        self.pop()
    }

    fn pop(&self) -> ReadSet {
        let mut frames = self.context.frames.lock();
        match frames.iter().rposition(|frame| frame.id == self.id) {
            Some(index) => {
                // Verify we're popping the right frame.
                // This helps catch computations that leave frames behind.
                debug_assert_eq!(
                    index + 1,
                    frames.len(),
                    "TrackingScope mismatch: frame {:?} is not on top",
                    self.id
                );
                frames.remove(index).reads
            }
            None => ReadSet::default(),
        }
    }
}

impl Drop for TrackingScope {
    fn drop(&mut self) {
        if !self.ended {
            self.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::subscriber::{Callback, SubscriptionId};

    struct FakeSource(SourceId);

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(Self(SourceId::new()))
        }
    }

    impl Source for FakeSource {
        fn source_id(&self) -> SourceId {
            self.0
        }

        fn add_subscriber(&self, _notify: Callback) -> Option<SubscriptionId> {
            None
        }

        fn remove_subscriber(&self, _id: SubscriptionId) -> bool {
            false
        }
    }

    #[test]
    fn reads_outside_a_frame_are_untracked() {
        let ctx = TrackingContext::new();
        let source = FakeSource::new();

        assert!(!ctx.is_tracking());
        ctx.track(&source);
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn frame_collects_reads_once() {
        let ctx = TrackingContext::new();
        let a = FakeSource::new();
        let b = FakeSource::new();

        let frame = ctx.begin_frame();
        assert!(ctx.is_tracking());
        ctx.track(&a);
        ctx.track(&b);
        ctx.track(&a);

        let reads = ctx.end_frame(frame).unwrap();
        assert_eq!(reads.ids().collect::<Vec<_>>(), vec![a.0, b.0]);
        assert!(!ctx.is_tracking());
    }

    #[test]
    fn nested_frames_record_separately() {
        let ctx = TrackingContext::new();
        let outer_source = FakeSource::new();
        let inner_source = FakeSource::new();

        let outer = ctx.begin_frame();
        ctx.track(&outer_source);
        {
            let inner = ctx.begin_frame();
            ctx.track(&inner_source);
            let inner_reads = ctx.end_frame(inner).unwrap();
            assert!(inner_reads.contains(inner_source.0));
            assert!(!inner_reads.contains(outer_source.0));
        }
        let outer_reads = ctx.end_frame(outer).unwrap();
        assert_eq!(outer_reads.len(), 1);
        assert!(outer_reads.contains(outer_source.0));
    }

    #[test]
    fn ending_a_buried_frame_is_rejected() {
        let ctx = TrackingContext::new();
        let outer = ctx.begin_frame();
        let inner = ctx.begin_frame();

        let err = ctx.end_frame(outer).unwrap_err();
        assert!(matches!(err, Error::FrameMismatch { .. }));
        assert_eq!(ctx.depth(), 2);

        ctx.end_frame(inner).unwrap();
        ctx.end_frame(outer).unwrap();
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn untracked_shields_outer_frame() {
        let ctx = TrackingContext::new();
        let source = FakeSource::new();

        let (_, reads) = ctx.run(|| {
            ctx.untracked(|| ctx.track(&source));
        });
        assert!(reads.is_empty());
    }

    #[test]
    fn scope_pops_on_panic() {
        let ctx = TrackingContext::new();
        let ctx_clone = ctx.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = ctx_clone.scope();
            panic!("computation failed");
        }));

        assert!(result.is_err());
        assert_eq!(ctx.depth(), 0);
    }
}
