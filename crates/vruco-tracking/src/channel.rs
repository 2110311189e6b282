//! Single-slot pose hand-off between the tracker and a consumer.
//!
//! The record holds one pose and a `new_data_available` flag. The producer
//! writes only while the flag is clear and sets it last; the consumer reads
//! only while the flag is set and clears it last.
//!
//! Ordering: the flag is loaded with `Acquire` and stored with `Release` on
//! both sides. Field accesses are `Relaxed`; the flag orders them, so a
//! reader that observes the flag set sees every field of the same publish.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A pose as published to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    /// Position in the consumer's room frame, metres.
    pub position: [f32; 3],
    /// Orientation quaternion `[x, y, z, w]`.
    pub orientation: [f32; 4],
}

/// Handshake state of a [`PoseChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No unread pose; the producer may write.
    Idle,
    /// A pose is waiting for the consumer; the producer must not write.
    Ready,
}

/// The shared pose record.
///
/// Layout matches three `f32`, four `f32` and one `bool`, so the same record can
/// live in a shared memory mapping (see [`crate::shm::SharedPoseRegion`]).
#[repr(C)]
#[derive(Debug, Default)]
pub struct PoseChannel {
    position: [AtomicU32; 3],
    orientation: [AtomicU32; 4],
    new_data_available: AtomicBool,
}

impl PoseChannel {
    /// An idle channel holding a zero pose.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current handshake state.
    pub fn state(&self) -> ChannelState {
        if self.is_ready() {
            ChannelState::Ready
        } else {
            ChannelState::Idle
        }
    }

    /// Whether an unread pose is waiting.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.new_data_available.load(Ordering::Acquire)
    }

    /// Write `pose` and mark it available.
    ///
    /// Returns `false` without touching the record while the previous pose is unread.
    pub fn publish(&self, pose: &Pose) -> bool {
        if self.is_ready() {
            return false;
        }
        for (slot, v) in self.position.iter().zip(pose.position) {
            slot.store(v.to_bits(), Ordering::Relaxed);
        }
        for (slot, v) in self.orientation.iter().zip(pose.orientation) {
            slot.store(v.to_bits(), Ordering::Relaxed);
        }
        self.new_data_available.store(true, Ordering::Release);
        true
    }

    /// Copy out the waiting pose and mark the record free.
    pub fn try_consume(&self) -> Option<Pose> {
        if !self.is_ready() {
            return None;
        }
        let pose = Pose {
            position: std::array::from_fn(|i| {
                f32::from_bits(self.position[i].load(Ordering::Relaxed))
            }),
            orientation: std::array::from_fn(|i| {
                f32::from_bits(self.orientation[i].load(Ordering::Relaxed))
            }),
        };
        self.new_data_available.store(false, Ordering::Release);
        Some(pose)
    }
}
