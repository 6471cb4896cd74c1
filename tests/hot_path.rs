//! Allocation check for the per-frame path
//!
//! A counting global allocator wraps the system one; only allocations made
//! on the test thread while counting is switched on are recorded.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use voice_terminal::audio::Frame;
use voice_terminal::config::{VadConfig, WakeWordConfig};
use voice_terminal::transport::encode_packet;
use voice_terminal::transport::packet::{MAX_PACKET_LEN, PacketKind, VadBlock, WakeBlock};
use voice_terminal::vad::Detector;

mod common;
use common::{constant, wake_phrase};

struct CountingAllocator;

static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
}

fn record() {
    if COUNTING.try_with(Cell::get).unwrap_or(false) {
        ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record();
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        record();
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        record();
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

fn allocations_during(f: impl FnOnce()) -> u64 {
    let before = ALLOCATIONS.load(Ordering::Relaxed);
    COUNTING.with(|c| c.set(true));
    f();
    COUNTING.with(|c| c.set(false));
    ALLOCATIONS.load(Ordering::Relaxed) - before
}

/// Classify and packetize every frame the way the audio task does
fn run(detector: &mut Detector, frames: &[Frame], buf: &mut [u8; MAX_PACKET_LEN]) -> usize {
    let mut packets = 0;
    for (sequence, frame) in (0u32..).zip(frames) {
        let (result, wake) = detector.process(frame);
        let vad = VadBlock::from_result(&result);
        let kind = match wake {
            Some(event) => PacketKind::WakeWord {
                vad,
                wake: WakeBlock::from_event(&event),
            },
            None => PacketKind::Vad(vad),
        };
        if encode_packet(sequence, &kind, frame.samples(), buf).is_ok() {
            packets += 1;
        }
    }
    packets
}

#[test]
fn test_detection_and_packet_path_does_not_allocate() {
    let (mut detector, handle) =
        Detector::new(VadConfig::default(), WakeWordConfig::default(), 8).unwrap();
    let mut frames = constant(50, 60);
    frames.extend(wake_phrase());
    frames.extend(constant(4000, 30));
    frames.extend(constant(50, 80));
    let mut buf = [0u8; MAX_PACKET_LEN];

    // First pass settles lazily initialized state
    assert_eq!(run(&mut detector, &frames, &mut buf), frames.len());

    let mut packets = 0;
    let allocations = allocations_during(|| {
        packets = run(&mut detector, &frames, &mut buf);
    });
    assert_eq!(packets, frames.len());
    assert_eq!(allocations, 0, "{allocations} allocations on the frame path");
    drop(handle);
}
