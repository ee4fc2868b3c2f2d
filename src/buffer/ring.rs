use std::collections::VecDeque;

use crate::camera::Frame;

/// Time-indexed queue of recent frames, bounded by duration. Frames carry
/// shared pixel data, so `range` hands out cheap clones that stay valid
/// after the buffer has moved on.
pub struct RingBuffer {
    frames: VecDeque<Frame>,
    max_span: f64,
}

impl RingBuffer {
    pub fn new(max_span_seconds: f64) -> Self {
        Self {
            frames: VecDeque::new(),
            max_span: max_span_seconds,
        }
    }

    /// Append a frame and trim everything older than the span in the same
    /// call. Out-of-order or duplicate timestamps are rejected; the newest
    /// timestamp is monotone increasing.
    pub fn add(&mut self, frame: Frame) {
        if let Some(newest) = self.frames.back() {
            if frame.ts <= newest.ts {
                tracing::warn!(
                    ts = frame.ts,
                    newest = newest.ts,
                    "dropping out-of-order frame"
                );
                return;
            }
        }
        let cutoff = frame.ts - self.max_span;
        self.frames.push_back(frame);
        while let Some(front) = self.frames.front() {
            if front.ts < cutoff {
                self.frames.pop_front();
            } else {
                break;
            }
        }
    }

    /// All frames with `t0 <= ts <= t1`, in increasing ts order.
    pub fn range(&self, t0: f64, t1: f64) -> Vec<Frame> {
        self.frames
            .iter()
            .filter(|f| f.ts >= t0 && f.ts <= t1)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Seconds covered between the oldest and newest frame.
    pub fn span_seconds(&self) -> f64 {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => last.ts - first.ts,
            _ => 0.0,
        }
    }

    pub fn newest_ts(&self) -> Option<f64> {
        self.frames.back().map(|f| f.ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opencv::core::{Mat, Scalar, CV_8UC1};

    fn frame(ts: f64) -> Frame {
        let img = Mat::new_rows_cols_with_default(4, 4, CV_8UC1, Scalar::all(0.0)).unwrap();
        Frame::new(ts, Utc::now(), img)
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let mut buf = RingBuffer::new(60.0);
        for ts in [1.0, 2.0, 3.0, 4.0, 5.0] {
            buf.add(frame(ts));
        }
        let got = buf.range(2.0, 4.0);
        let ts: Vec<f64> = got.iter().map(|f| f.ts).collect();
        assert_eq!(ts, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn add_evicts_beyond_span_in_same_call() {
        let mut buf = RingBuffer::new(5.0);
        for ts in [1.0, 2.0, 3.0] {
            buf.add(frame(ts));
        }
        buf.add(frame(9.0));
        // 1.0..3.0 are all older than 9.0 - 5.0.
        let ts: Vec<f64> = buf.range(0.0, 100.0).iter().map(|f| f.ts).collect();
        assert_eq!(ts, vec![9.0]);
    }

    #[test]
    fn rejects_out_of_order_frames() {
        let mut buf = RingBuffer::new(60.0);
        buf.add(frame(5.0));
        buf.add(frame(4.0));
        buf.add(frame(5.0));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.newest_ts(), Some(5.0));
    }

    #[test]
    fn shares_survive_eviction() {
        let mut buf = RingBuffer::new(5.0);
        buf.add(frame(1.0));
        let kept = buf.range(0.0, 2.0);
        buf.add(frame(100.0));
        assert_eq!(buf.len(), 1);
        // The extracted share still holds its pixel data.
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].ts, 1.0);
        assert!(!kept[0].img.empty());
    }

    #[test]
    fn span_tracks_window() {
        let mut buf = RingBuffer::new(30.0);
        assert_eq!(buf.span_seconds(), 0.0);
        buf.add(frame(10.0));
        buf.add(frame(12.5));
        assert!((buf.span_seconds() - 2.5).abs() < 1e-9);
    }
}
