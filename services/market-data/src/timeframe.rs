//! Processed-history bookkeeping
//!
//! A [`TimeFrame`] is a contiguous interval of trade history known to have
//! been delivered to subscribers. The dispatcher keeps an ordered list of
//! them: each run appends a frame for "now", catch-up fetches extend frames
//! backwards, and the space between two neighbours is a gap that still has
//! to be fetched.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeFrame {
    pub first_time: i64,
    pub last_time: i64,
}

impl TimeFrame {
    pub fn at(ts: i64) -> Self {
        Self {
            first_time: ts,
            last_time: ts,
        }
    }
}

/// Unfetched history between two frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Index of the newer frame; fetching the gap extends it backwards.
    pub index: usize,
    pub from: i64,
    pub to: i64,
}

/// Ordered list of frames, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeFrames(Vec<TimeFrame>);

impl TimeFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(frames: Vec<TimeFrame>) -> Self {
        Self(frames)
    }

    pub fn as_slice(&self) -> &[TimeFrame] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, frame: TimeFrame) {
        self.0.push(frame);
    }

    pub fn last(&self) -> Option<&TimeFrame> {
        self.0.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut TimeFrame> {
        self.0.last_mut()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TimeFrame> {
        self.0.get_mut(index)
    }

    /// Lower a frame's `first_time` to `ts` if `ts` is earlier.
    pub fn extend_back(&mut self, index: usize, ts: i64) {
        if let Some(frame) = self.0.get_mut(index) {
            frame.first_time = frame.first_time.min(ts);
        }
    }

    /// Raise the newest frame's `last_time` to `ts` if `ts` is later.
    pub fn advance_last(&mut self, ts: i64) {
        if let Some(frame) = self.0.last_mut() {
            frame.last_time = frame.last_time.max(ts);
        }
    }

    /// Whether `ts` lies strictly inside some frame.
    ///
    /// Resume and gap fetches start at a frame's `last_time` and stop before
    /// the next frame's `first_time`, so they can only return trades that
    /// are not interior.
    pub fn is_interior(&self, ts: i64) -> bool {
        self.0
            .iter()
            .any(|frame| frame.first_time < ts && ts < frame.last_time)
    }

    /// Gaps between neighbouring frames, newest first.
    pub fn gaps(&self) -> Vec<Gap> {
        (1..self.0.len())
            .rev()
            .filter_map(|i| {
                let current = self.0[i];
                let previous = self.0[i - 1];
                (current.first_time > previous.last_time).then_some(Gap {
                    index: i,
                    from: previous.last_time,
                    to: current.first_time,
                })
            })
            .collect()
    }

    /// Merge neighbours that touch or overlap.
    pub fn coalesce(&mut self) {
        let mut i = self.0.len();
        while i > 1 {
            i -= 1;
            let current = self.0[i];
            let previous = &mut self.0[i - 1];
            if current.first_time <= previous.last_time {
                previous.first_time = previous.first_time.min(current.first_time);
                previous.last_time = previous.last_time.max(current.last_time);
                self.0.remove(i);
            }
        }
    }
}
