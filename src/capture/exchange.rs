//! Lock-free double-buffered frame exchange
//!
//! Each camera stream owns exactly two slots. The capture thread holds the only
//! [`FramePublisher`] and always fills the slot named by the write-target index;
//! readers always look at the other one. Publishing a frame stamps the slot,
//! flips the index with release ordering and bumps the stream's identifier
//! counter, so a reader that observes the flip also observes every byte of the
//! frame behind it.
//!
//! Readers pin the slot they are looking at for the lifetime of the returned
//! [`FrameView`]. The writer never fills a pinned slot; it backs off until the
//! pin is released. The render path holds a view only for the duration of one
//! texture upload, far shorter than the acquisition interval, so in practice
//! the writer never waits.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::{Backoff, CachePadded};

use crate::capture::frame::{Eye, FrameFormat, StereoIds};
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, Default)]
struct SlotMeta {
    id: u64,
    captured_at: Option<Instant>,
}

struct Slot {
    pixels: UnsafeCell<Box<[u8]>>,
    meta: UnsafeCell<SlotMeta>,
    readers: CachePadded<AtomicUsize>,
}

impl Slot {
    fn new(len: usize) -> Self {
        Self {
            pixels: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
            meta: UnsafeCell::new(SlotMeta::default()),
            readers: CachePadded::new(AtomicUsize::new(0)),
        }
    }
}

struct StreamState {
    eye: Eye,
    format: FrameFormat,
    write_index: CachePadded<AtomicUsize>,
    frame_id: CachePadded<AtomicU64>,
    slots: [Slot; 2],
}

// SAFETY: slot contents are only written by the single `FramePublisher`, and
// only while the slot is the write target and unpinned. Readers only touch a
// slot after pinning it and confirming it is not the write target. The pin
// count and write index are both accessed with SeqCst, so either the writer
// sees the pin or the reader sees the flip.
unsafe impl Sync for StreamState {}

/// Creates the exchange for one camera stream.
///
/// The publisher is move-only so the stream has exactly one writer; the reader
/// can be cloned freely.
pub fn exchange(eye: Eye, format: FrameFormat) -> (FramePublisher, FrameReader) {
    let len = format.frame_len();
    let state = Arc::new(StreamState {
        eye,
        format,
        write_index: CachePadded::new(AtomicUsize::new(0)),
        frame_id: CachePadded::new(AtomicU64::new(0)),
        slots: [Slot::new(len), Slot::new(len)],
    });

    (
        FramePublisher {
            state: state.clone(),
            next_id: 0,
        },
        FrameReader { state },
    )
}

/// Write half of a stream, owned by its capture thread
pub struct FramePublisher {
    state: Arc<StreamState>,
    next_id: u64,
}

impl FramePublisher {
    pub fn eye(&self) -> Eye {
        self.state.eye
    }

    pub fn format(&self) -> FrameFormat {
        self.state.format
    }

    /// Copies `pixels` into the write slot and publishes it.
    pub fn publish(&mut self, pixels: &[u8]) -> Result<u64, CaptureError> {
        let expected = self.state.format.frame_len();
        if pixels.len() != expected {
            return Err(CaptureError::SizeMismatch {
                expected,
                actual: pixels.len(),
            });
        }

        self.publish_with(|slot| {
            slot.copy_from_slice(pixels);
            Ok(())
        })
    }

    /// Lets `fill` write the frame straight into the write slot.
    ///
    /// If `fill` fails nothing is published: the index is not flipped and the
    /// reader keeps seeing the previous complete frame.
    pub fn publish_with<E, F>(&mut self, fill: F) -> Result<u64, E>
    where
        F: FnOnce(&mut [u8]) -> Result<(), E>,
    {
        let state = &*self.state;
        // Only this publisher ever stores the index.
        let target = state.write_index.load(Ordering::Relaxed);
        let slot = &state.slots[target];

        let backoff = Backoff::new();
        while slot.readers.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }

        // SAFETY: `target` is the write slot and no reader holds a pin on it.
        // Readers that pin it from here on observe the index unchanged only
        // after the flip below, i.e. after this write completed.
        let pixels = unsafe { &mut **slot.pixels.get() };
        fill(pixels)?;

        let id = self.next_id + 1;
        // SAFETY: same exclusivity as the pixel write above.
        unsafe {
            *slot.meta.get() = SlotMeta {
                id,
                captured_at: Some(Instant::now()),
            };
        }
        self.next_id = id;

        state.write_index.store(1 - target, Ordering::SeqCst);
        state.frame_id.store(id, Ordering::Release);
        Ok(id)
    }
}

impl fmt::Debug for FramePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePublisher")
            .field("eye", &self.state.eye)
            .field("next_id", &self.next_id)
            .finish()
    }
}

/// Read half of a stream
#[derive(Clone)]
pub struct FrameReader {
    state: Arc<StreamState>,
}

impl FrameReader {
    pub fn eye(&self) -> Eye {
        self.state.eye
    }

    pub fn format(&self) -> FrameFormat {
        self.state.format
    }

    /// Identifier of the newest published frame, 0 if none yet.
    ///
    /// This is only a version stamp for "has anything changed"; the slot to
    /// read is always chosen from the write-target index.
    pub fn latest_id(&self) -> u64 {
        self.state.frame_id.load(Ordering::Acquire)
    }

    /// Pins and returns the newest complete frame, or `None` if the device has
    /// not produced one yet.
    pub fn read_latest(&self) -> Option<FrameView<'_>> {
        let state = &*self.state;
        loop {
            let target = state.write_index.load(Ordering::SeqCst);
            let slot = &state.slots[1 - target];

            slot.readers.fetch_add(1, Ordering::SeqCst);
            if state.write_index.load(Ordering::SeqCst) != target {
                // The writer flipped between our load and the pin.
                slot.readers.fetch_sub(1, Ordering::Release);
                continue;
            }

            // SAFETY: the slot is pinned and not the write target.
            let meta = unsafe { *slot.meta.get() };
            if meta.id == 0 {
                slot.readers.fetch_sub(1, Ordering::Release);
                return None;
            }

            // SAFETY: as above; the writer will not touch these bytes until
            // the view is dropped.
            let pixels: &[u8] = unsafe { &**slot.pixels.get() };
            return Some(FrameView {
                eye: state.eye,
                format: state.format,
                id: meta.id,
                captured_at: meta.captured_at,
                pixels,
                pin: &slot.readers,
            });
        }
    }
}

impl fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("eye", &self.state.eye)
            .field("latest_id", &self.latest_id())
            .finish()
    }
}

/// Read-only view of a complete frame. The slot stays pinned until drop.
pub struct FrameView<'a> {
    eye: Eye,
    format: FrameFormat,
    id: u64,
    captured_at: Option<Instant>,
    pixels: &'a [u8],
    pin: &'a AtomicUsize,
}

impl FrameView<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn eye(&self) -> Eye {
        self.eye
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// When the capture thread finished writing this frame.
    pub fn captured_at(&self) -> Option<Instant> {
        self.captured_at
    }

    pub fn pixels(&self) -> &[u8] {
        self.pixels
    }
}

impl Deref for FrameView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.pixels
    }
}

impl Drop for FrameView<'_> {
    fn drop(&mut self) {
        self.pin.fetch_sub(1, Ordering::Release);
    }
}

impl fmt::Debug for FrameView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameView")
            .field("eye", &self.eye)
            .field("id", &self.id)
            .field("len", &self.pixels.len())
            .finish()
    }
}

/// Both streams of the stereo pair, as seen by a consumer
#[derive(Clone, Debug)]
pub struct StereoReader {
    left: FrameReader,
    right: FrameReader,
}

impl StereoReader {
    pub fn new(left: FrameReader, right: FrameReader) -> Self {
        debug_assert_eq!(left.eye(), Eye::Left);
        debug_assert_eq!(right.eye(), Eye::Right);
        Self { left, right }
    }

    pub fn reader(&self, eye: Eye) -> &FrameReader {
        match eye {
            Eye::Left => &self.left,
            Eye::Right => &self.right,
        }
    }

    pub fn latest_ids(&self) -> StereoIds {
        StereoIds::new(self.left.latest_id(), self.right.latest_id())
    }

    /// Pins the newest frame of both streams.
    pub fn read_latest(&self) -> StereoView<'_> {
        StereoView {
            left: self.left.read_latest(),
            right: self.right.read_latest(),
        }
    }
}

/// A pinned frame pair; either eye may still be missing
#[derive(Debug)]
pub struct StereoView<'a> {
    pub left: Option<FrameView<'a>>,
    pub right: Option<FrameView<'a>>,
}

impl<'a> StereoView<'a> {
    pub fn get(&self, eye: Eye) -> Option<&FrameView<'a>> {
        match eye {
            Eye::Left => self.left.as_ref(),
            Eye::Right => self.right.as_ref(),
        }
    }

    pub fn ids(&self) -> StereoIds {
        StereoIds::new(
            self.left.as_ref().map_or(0, FrameView::id),
            self.right.as_ref().map_or(0, FrameView::id),
        )
    }

    pub fn is_complete(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    /// Capture instant of the older eye, used as the start of a latency sample.
    pub fn oldest_capture(&self) -> Option<Instant> {
        [self.left.as_ref(), self.right.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(FrameView::captured_at)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    const FORMAT: FrameFormat = FrameFormat::rgb(4, 2);

    fn filled(byte: u8) -> Vec<u8> {
        vec![byte; FORMAT.frame_len()]
    }

    #[test]
    fn empty_stream_is_not_ready() {
        let (_publisher, reader) = exchange(Eye::Left, FORMAT);
        assert!(reader.read_latest().is_none());
        assert_eq!(reader.latest_id(), 0);
    }

    #[test]
    fn published_frame_reads_back_exactly() {
        let (mut publisher, reader) = exchange(Eye::Left, FORMAT);
        let pixels: Vec<u8> = (0..FORMAT.frame_len() as u8).collect();
        let id = publisher.publish(&pixels).unwrap();

        let view = reader.read_latest().unwrap();
        assert_eq!(view.id(), id);
        assert_eq!(view.pixels(), &pixels[..]);
        assert!(view.captured_at().is_some());
    }

    #[test]
    fn repeated_reads_are_stable() {
        let (mut publisher, reader) = exchange(Eye::Right, FORMAT);
        publisher.publish(&filled(7)).unwrap();

        let first = reader.read_latest().map(|v| (v.id(), v.to_vec()));
        for _ in 0..5 {
            let again = reader.read_latest().map(|v| (v.id(), v.to_vec()));
            assert_eq!(first, again);
        }
    }

    #[test]
    fn failed_fill_publishes_nothing() {
        let (mut publisher, reader) = exchange(Eye::Left, FORMAT);
        publisher.publish(&filled(1)).unwrap();

        let result: Result<u64, &str> = publisher.publish_with(|slot| {
            slot.fill(9);
            Err("device hiccup")
        });
        assert!(result.is_err());

        let view = reader.read_latest().unwrap();
        assert_eq!(view.id(), 1);
        assert!(view.iter().all(|&b| b == 1));
    }

    #[test]
    fn wrong_size_is_rejected() {
        let (mut publisher, _reader) = exchange(Eye::Left, FORMAT);
        let err = publisher.publish(&[0u8; 3]).unwrap_err();
        assert!(matches!(err, CaptureError::SizeMismatch { actual: 3, .. }));
    }

    #[test]
    fn writer_waits_for_pinned_slot() {
        let (mut publisher, reader) = exchange(Eye::Left, FORMAT);
        publisher.publish(&filled(1)).unwrap();

        let view = reader.read_latest().unwrap();
        assert_eq!(view.id(), 1);

        let writer = thread::spawn(move || {
            // Frame 2 goes to the free slot, frame 3 needs the pinned one.
            publisher.publish(&filled(2)).unwrap();
            publisher.publish(&filled(3)).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(reader.latest_id(), 2);
        assert!(view.iter().all(|&b| b == 1));

        drop(view);
        writer.join().unwrap();

        let view = reader.read_latest().unwrap();
        assert_eq!(view.id(), 3);
        assert!(view.iter().all(|&b| b == 3));
    }

    #[test]
    fn stereo_view_reports_missing_eye() {
        let (mut left, left_reader) = exchange(Eye::Left, FORMAT);
        let (_right, right_reader) = exchange(Eye::Right, FORMAT);
        let stereo = StereoReader::new(left_reader, right_reader);

        left.publish(&filled(4)).unwrap();
        let view = stereo.read_latest();
        assert!(!view.is_complete());
        assert_eq!(view.ids(), StereoIds::new(1, 0));
        assert!(!stereo.latest_ids().is_ready());
    }
}
