use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::DetectionParams;

use super::detector::Candidate;
use super::mask::NuisanceMap;

/// Consecutive points closer than this count as stationary.
const STATIONARY_EPSILON: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
pub struct TrackPoint {
    pub ts: f64,
    pub x: f64,
    pub y: f64,
    pub brightness: f64,
    pub area: f64,
}

/// A temporally-ordered chain of candidates believed to be one object.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub points: Vec<TrackPoint>,
}

impl Track {
    fn new(id: u64, point: TrackPoint) -> Self {
        Self {
            id,
            points: vec![point],
        }
    }

    pub fn first_ts(&self) -> f64 {
        self.points.first().map(|p| p.ts).unwrap_or(0.0)
    }

    pub fn last_ts(&self) -> f64 {
        self.points.last().map(|p| p.ts).unwrap_or(0.0)
    }

    pub fn duration(&self) -> f64 {
        self.last_ts() - self.first_ts()
    }

    /// Euclidean distance from the first to the last point.
    pub fn path_length(&self) -> f64 {
        match (self.points.first(), self.points.last()) {
            (Some(a), Some(b)) => ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt(),
            _ => 0.0,
        }
    }

    pub fn mean_speed(&self) -> f64 {
        let duration = self.duration();
        if duration > 0.0 {
            self.path_length() / duration
        } else {
            f64::INFINITY
        }
    }

    pub fn peak_brightness(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.brightness)
            .fold(0.0, f64::max)
    }

    /// First principal component's share of total variance of the point
    /// cloud. 1.0 = perfectly collinear.
    pub fn linearity(&self) -> f64 {
        let n = self.points.len();
        if n < 2 {
            return 0.0;
        }
        let nf = n as f64;
        let mean_x = self.points.iter().map(|p| p.x).sum::<f64>() / nf;
        let mean_y = self.points.iter().map(|p| p.y).sum::<f64>() / nf;
        let mut sxx = 0.0;
        let mut syy = 0.0;
        let mut sxy = 0.0;
        for p in &self.points {
            let dx = p.x - mean_x;
            let dy = p.y - mean_y;
            sxx += dx * dx;
            syy += dy * dy;
            sxy += dx * dy;
        }
        let total = sxx + syy;
        if total <= f64::EPSILON {
            return 0.0;
        }
        let disc = ((sxx - syy).powi(2) + 4.0 * sxy * sxy).sqrt();
        let lambda_major = (sxx + syy + disc) / 2.0;
        lambda_major / total
    }

    /// Fraction of consecutive point pairs that barely moved.
    pub fn stationary_ratio(&self) -> f64 {
        if self.points.len() < 2 {
            return 0.0;
        }
        let pairs = self.points.len() - 1;
        let still = self
            .points
            .windows(2)
            .filter(|w| {
                let dx = w[1].x - w[0].x;
                let dy = w[1].y - w[0].y;
                (dx * dx + dy * dy).sqrt() < STATIONARY_EPSILON
            })
            .count();
        still as f64 / pairs as f64
    }
}

/// A finalised, accepted track. Derived once; immutable afterwards.
/// `wall_timestamp` is the finalisation instant, so per-camera events
/// always append to the log in non-decreasing timestamp order.
#[derive(Debug, Clone)]
pub struct MeteorEvent {
    pub wall_timestamp: DateTime<Utc>,
    pub start_ts: f64,
    pub end_ts: f64,
    pub start_point: (i32, i32),
    pub end_point: (i32, i32),
    pub peak_brightness: f64,
    pub confidence: f64,
    pub length_px: f64,
    pub duration_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TrackPoints,
    Duration,
    Length,
    Speed,
    Linearity,
    Stationary,
    NuisancePath,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::TrackPoints => "track_points",
            RejectReason::Duration => "duration",
            RejectReason::Length => "length",
            RejectReason::Speed => "speed",
            RejectReason::Linearity => "linearity",
            RejectReason::Stationary => "stationary",
            RejectReason::NuisancePath => "nuisance_path",
        }
    }
}

#[derive(Debug, Clone)]
pub enum FinalizedTrack {
    Accepted(MeteorEvent),
    Rejected { track_id: u64, reason: RejectReason },
}

/// Associates candidates into tracks, closes them on gap timeout, merges
/// consecutively closed fragments, and evaluates the acceptance predicates.
pub struct Tracker {
    params: DetectionParams,
    nuisance: Option<Arc<NuisanceMap>>,
    open: Vec<Track>,
    /// Closed tracks held back for the merge window, oldest first.
    pending: Vec<Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new(params: DetectionParams) -> Self {
        Self {
            params,
            nuisance: None,
            open: Vec::new(),
            pending: Vec::new(),
            next_id: 1,
        }
    }

    pub fn set_params(&mut self, params: DetectionParams) {
        self.params = params;
    }

    pub fn set_nuisance(&mut self, nuisance: Option<Arc<NuisanceMap>>) {
        self.nuisance = nuisance;
    }

    pub fn has_open_tracks(&self) -> bool {
        !self.open.is_empty()
    }

    pub fn open_tracks(&self) -> &[Track] {
        &self.open
    }

    /// One detection step: associate this frame's candidates, close tracks
    /// that timed out, and finalise whatever fell out of the merge window.
    /// `wall` stamps anything finalised during this step.
    pub fn observe(
        &mut self,
        now_ts: f64,
        candidates: &[Candidate],
        wall: DateTime<Utc>,
    ) -> Vec<FinalizedTrack> {
        self.associate(candidates);
        self.close_timed_out(now_ts);
        self.finalize_expired(now_ts, wall)
    }

    fn associate(&mut self, candidates: &[Candidate]) {
        let mut taken = vec![false; self.open.len()];

        for c in candidates {
            let mut best: Option<(usize, f64)> = None;
            for (i, track) in self.open.iter().enumerate() {
                if taken[i] {
                    continue;
                }
                let last = track.points.last().expect("open track has points");
                if c.frame_ts - last.ts > self.params.max_gap_time {
                    continue;
                }
                let dist = ((c.cx - last.x).powi(2) + (c.cy - last.y).powi(2)).sqrt();
                if dist > self.params.max_distance {
                    continue;
                }
                // Tie-break: smaller distance, then older track. Iteration
                // order is creation order, so strict `<` keeps the elder.
                match best {
                    Some((_, best_dist)) if dist >= best_dist => {}
                    _ => best = Some((i, dist)),
                }
            }

            let point = TrackPoint {
                ts: c.frame_ts,
                x: c.cx,
                y: c.cy,
                brightness: c.brightness,
                area: c.area,
            };

            match best {
                Some((i, _)) => {
                    taken[i] = true;
                    self.open[i].points.push(point);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.open.push(Track::new(id, point));
                    taken.push(true);
                }
            }
        }
    }

    fn close_timed_out(&mut self, now_ts: f64) {
        let max_gap = self.params.max_gap_time;
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.open.len() {
            if now_ts - self.open[i].last_ts() > max_gap {
                expired.push(self.open.remove(i));
            } else {
                i += 1;
            }
        }
        // Close in chronological order, not creation order, so every
        // merge chain sees its true predecessor first.
        expired.sort_by(|a, b| a.last_ts().total_cmp(&b.last_ts()));
        for track in expired {
            self.push_closed(track);
        }
    }

    /// Merge pass: a freshly closed fragment joins the pending track whose
    /// end lies nearest before its start, when the gap, endpoint distance
    /// and speed-ratio gates all pass. Scanning every pending track keeps
    /// a chain intact even when unrelated objects close in between.
    /// Left-to-right and associative; the absorbing track stays pending.
    fn push_closed(&mut self, track: Track) {
        let mut best: Option<usize> = None;
        for (i, prev) in self.pending.iter().enumerate() {
            if !Self::mergeable(&self.params, prev, &track) {
                continue;
            }
            match best {
                Some(j) if self.pending[j].last_ts() >= prev.last_ts() => {}
                _ => best = Some(i),
            }
        }
        if let Some(i) = best {
            let prev = &mut self.pending[i];
            tracing::debug!(
                into = prev.id,
                from = track.id,
                "merged track fragments"
            );
            prev.points.extend(track.points);
            return;
        }
        self.pending.push(track);
    }

    fn mergeable(params: &DetectionParams, a: &Track, b: &Track) -> bool {
        // Fragments of one object are consecutive in time; overlapping
        // tracks are distinct objects and never merge.
        let gap = b.first_ts() - a.last_ts();
        if gap < 0.0 || gap > params.merge_max_gap_time {
            return false;
        }
        let (end, start) = match (a.points.last(), b.points.first()) {
            (Some(end), Some(start)) => (end, start),
            _ => return false,
        };
        let dist = ((start.x - end.x).powi(2) + (start.y - end.y).powi(2)).sqrt();
        if dist > params.merge_max_distance {
            return false;
        }
        let (va, vb) = (a.mean_speed(), b.mean_speed());
        if !va.is_finite() || !vb.is_finite() || va <= 0.0 || vb <= 0.0 {
            return false;
        }
        let ratio = (va / vb).min(vb / va);
        ratio >= params.merge_max_speed_ratio
    }

    fn finalize_expired(&mut self, now_ts: f64, wall: DateTime<Utc>) -> Vec<FinalizedTrack> {
        // Anything older than the merge window can no longer absorb a
        // fragment, so it is safe to evaluate.
        let horizon = self.params.max_gap_time + self.params.merge_max_gap_time;
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if now_ts - self.pending[i].last_ts() > horizon {
                let track = self.pending.remove(i);
                out.push(self.evaluate(track, wall));
            } else {
                i += 1;
            }
        }
        out
    }

    /// Close and evaluate everything, merge pass included. Used at
    /// shutdown.
    pub fn finalize_all(&mut self) -> Vec<FinalizedTrack> {
        let wall = Utc::now();
        let mut open = std::mem::take(&mut self.open);
        open.sort_by(|a, b| a.last_ts().total_cmp(&b.last_ts()));
        for track in open {
            self.push_closed(track);
        }
        let pending = std::mem::take(&mut self.pending);
        pending.into_iter().map(|t| self.evaluate(t, wall)).collect()
    }

    fn evaluate(&self, track: Track, wall: DateTime<Utc>) -> FinalizedTrack {
        if let Some(reason) = self.rejection(&track) {
            tracing::debug!(
                track = track.id,
                rejected_by = reason.as_str(),
                points = track.points.len(),
                duration = format!("{:.2}", track.duration()),
                length = format!("{:.1}", track.path_length()),
                "track rejected"
            );
            return FinalizedTrack::Rejected {
                track_id: track.id,
                reason,
            };
        }

        let first = track.points.first().expect("non-empty track");
        let last = track.points.last().expect("non-empty track");
        let length = track.path_length();
        let duration = track.duration();
        let speed = track.mean_speed();
        let linearity = track.linearity();
        let peak = track.peak_brightness();

        let confidence = (0.25 * (length / 100.0).min(1.0)
            + 0.20 * (speed / 20.0).min(1.0)
            + 0.25 * linearity
            + 0.20 * (peak / 255.0).min(1.0)
            + (duration * 0.002).min(0.2))
        .min(1.0);

        let event = MeteorEvent {
            wall_timestamp: wall,
            start_ts: first.ts,
            end_ts: last.ts,
            start_point: (first.x.round() as i32, first.y.round() as i32),
            end_point: (last.x.round() as i32, last.y.round() as i32),
            peak_brightness: peak,
            confidence,
            length_px: length,
            duration_s: duration,
        };

        tracing::info!(
            track = track.id,
            length = format!("{:.1}", length),
            duration = format!("{:.2}", duration),
            confidence = format!("{:.2}", confidence),
            "meteor event accepted"
        );
        FinalizedTrack::Accepted(event)
    }

    fn rejection(&self, track: &Track) -> Option<RejectReason> {
        let p = &self.params;

        if track.points.len() < p.min_track_points {
            return Some(RejectReason::TrackPoints);
        }
        let duration = track.duration();
        if duration < p.min_duration || duration > p.max_duration {
            return Some(RejectReason::Duration);
        }
        let length = track.path_length();
        if length < p.min_length || length > p.max_length {
            return Some(RejectReason::Length);
        }
        if track.mean_speed() < p.min_speed {
            return Some(RejectReason::Speed);
        }
        if track.linearity() < p.min_linearity {
            return Some(RejectReason::Linearity);
        }
        if track.stationary_ratio() > p.max_stationary_ratio {
            return Some(RejectReason::Stationary);
        }
        if let Some(map) = &self.nuisance {
            let on_mask = track
                .points
                .iter()
                .filter(|pt| map.hit(pt.x, pt.y))
                .count();
            let ratio = on_mask as f64 / track.points.len() as f64;
            if ratio > p.nuisance_path_overlap_threshold {
                return Some(RejectReason::NuisancePath);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Sensitivity;
    use opencv::core::Rect;

    fn candidate(ts: f64, x: f64, y: f64, brightness: f64) -> Candidate {
        Candidate {
            cx: x,
            cy: y,
            area: 10.0,
            brightness,
            bbox: Rect::new(x as i32 - 2, y as i32 - 2, 4, 4),
            frame_ts: ts,
        }
    }

    fn params() -> DetectionParams {
        DetectionParams::preset(Sensitivity::Medium)
    }

    fn wall() -> DateTime<Utc> {
        Utc::now()
    }

    /// Feed a sequence of (ts, x, y) points as single candidates, then
    /// flush. Returns everything finalised.
    fn run_track(params: DetectionParams, points: &[(f64, f64, f64)]) -> Vec<FinalizedTrack> {
        let mut tracker = Tracker::new(params);
        let mut out = Vec::new();
        for &(ts, x, y) in points {
            out.extend(tracker.observe(ts, &[candidate(ts, x, y, 240.0)], wall()));
        }
        out.extend(tracker.finalize_all());
        out
    }

    fn single_event(out: Vec<FinalizedTrack>) -> MeteorEvent {
        let mut events: Vec<MeteorEvent> = out
            .into_iter()
            .filter_map(|f| match f {
                FinalizedTrack::Accepted(e) => Some(e),
                FinalizedTrack::Rejected { .. } => None,
            })
            .collect();
        assert_eq!(events.len(), 1, "expected exactly one accepted event");
        events.pop().unwrap()
    }

    fn single_rejection(out: Vec<FinalizedTrack>) -> RejectReason {
        let mut reasons: Vec<RejectReason> = out
            .into_iter()
            .filter_map(|f| match f {
                FinalizedTrack::Rejected { reason, .. } => Some(reason),
                FinalizedTrack::Accepted(_) => None,
            })
            .collect();
        assert_eq!(reasons.len(), 1, "expected exactly one rejection");
        reasons.pop().unwrap()
    }

    #[test]
    fn linear_streak_is_accepted() {
        let pts: Vec<(f64, f64, f64)> = (0..6)
            .map(|i| (i as f64 * 0.1, 100.0 + i as f64 * 20.0, 50.0 + i as f64 * 8.0))
            .collect();
        let event = single_event(run_track(params(), &pts));
        assert_eq!(event.start_point, (100, 50));
        assert_eq!(event.end_point, (200, 90));
        assert!((event.duration_s - 0.5).abs() < 1e-9);
        assert!(event.confidence > 0.0 && event.confidence <= 1.0);
    }

    #[test]
    fn boundary_track_at_min_points_and_min_speed_is_accepted() {
        // Exactly min_track_points (4) points, speed exactly min_speed:
        // 20 px over 0.4 s = 50 px/s.
        let pts = [
            (0.0, 100.0, 100.0),
            (0.1333333333333, 106.6666666667, 100.0),
            (0.2666666666667, 113.3333333333, 100.0),
            (0.4, 120.0, 100.0),
        ];
        let event = single_event(run_track(params(), &pts));
        assert!((event.length_px - 20.0).abs() < 1e-6);
    }

    #[test]
    fn too_few_points_rejected_as_track_points() {
        let pts = [
            (0.0, 100.0, 100.0),
            (0.1, 120.0, 100.0),
            (0.2, 140.0, 100.0),
        ];
        assert_eq!(
            single_rejection(run_track(params(), &pts)),
            RejectReason::TrackPoints
        );
    }

    #[test]
    fn slow_track_rejected_as_speed() {
        // 24 px over 2 s = 12 px/s.
        let pts: Vec<(f64, f64, f64)> = (0..9)
            .map(|i| (i as f64 * 0.25, 100.0 + i as f64 * 3.0, 100.0))
            .collect();
        assert_eq!(
            single_rejection(run_track(params(), &pts)),
            RejectReason::Speed
        );
    }

    #[test]
    fn scattered_path_rejected_as_linearity() {
        // Corners of a square, net displacement only downward.
        let pts = [
            (0.0, 0.0, 0.0),
            (0.1, 20.0, 0.0),
            (0.2, 20.0, 20.0),
            (0.3, 0.0, 20.0),
            (0.4, 0.0, 24.0),
        ];
        assert_eq!(
            single_rejection(run_track(params(), &pts)),
            RejectReason::Linearity
        );
    }

    #[test]
    fn mostly_still_track_rejected_as_stationary() {
        let pts = [
            (0.0, 100.0, 100.0),
            (0.1, 100.1, 100.0),
            (0.2, 100.2, 100.0),
            (0.3, 130.0, 100.0),
            (0.4, 130.1, 100.0),
            (0.5, 130.2, 100.0),
        ];
        assert_eq!(
            single_rejection(run_track(params(), &pts)),
            RejectReason::Stationary
        );
    }

    #[test]
    fn long_duration_rejected_as_duration() {
        let pts: Vec<(f64, f64, f64)> = (0..25)
            .map(|i| (i as f64 * 0.5, 100.0 + i as f64 * 30.0, 100.0))
            .collect();
        assert_eq!(
            single_rejection(run_track(params(), &pts)),
            RejectReason::Duration
        );
    }

    #[test]
    fn nuisance_path_rejection() {
        use opencv::core::{Mat, Scalar, CV_8UC1};
        // Everything right of x = 50 is nuisance.
        let mut mask =
            Mat::new_rows_cols_with_default(200, 400, CV_8UC1, Scalar::all(0.0)).unwrap();
        use opencv::imgproc;
        imgproc::rectangle(
            &mut mask,
            Rect::new(50, 0, 350, 200),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let mut tracker = Tracker::new(params());
        tracker.set_nuisance(Some(Arc::new(NuisanceMap::new(mask, 1.0))));

        let mut out = Vec::new();
        for i in 0..6 {
            let ts = i as f64 * 0.1;
            let x = 60.0 + i as f64 * 20.0;
            out.extend(tracker.observe(ts, &[candidate(ts, x, 100.0, 240.0)], wall()));
        }
        out.extend(tracker.finalize_all());
        assert_eq!(single_rejection(out), RejectReason::NuisancePath);
    }

    #[test]
    fn blinking_streak_merges_into_one_event() {
        let mut p = params();
        p.max_gap_time = 0.5;
        p.merge_max_gap_time = 1.5;
        p.merge_max_distance = 80.0;

        let mut tracker = Tracker::new(p);
        let mut out = Vec::new();
        // Fragment A: 0.0..0.3 s moving right at 100 px/s.
        for i in 0..4 {
            let ts = i as f64 * 0.1;
            let x = 100.0 + i as f64 * 10.0;
            out.extend(tracker.observe(ts, &[candidate(ts, x, 100.0, 240.0)], wall()));
        }
        // Blink: 0.8 s of darkness, then fragment B resumes nearby at the
        // same speed.
        for i in 0..4 {
            let ts = 1.1 + i as f64 * 0.1;
            let x = 145.0 + i as f64 * 10.0;
            out.extend(tracker.observe(ts, &[candidate(ts, x, 100.0, 240.0)], wall()));
        }
        out.extend(tracker.observe(3.5, &[], wall()));
        out.extend(tracker.finalize_all());

        let event = single_event(out);
        assert_eq!(event.start_point.0, 100);
        assert_eq!(event.end_point.0, 175);
        assert!((event.duration_s - 1.4).abs() < 1e-9);
    }

    #[test]
    fn merge_survives_interleaved_unrelated_track() {
        let mut p = params();
        p.max_gap_time = 0.5;
        p.merge_max_gap_time = 1.5;
        p.merge_max_distance = 80.0;

        let mut tracker = Tracker::new(p);
        let mut out = Vec::new();
        // Meteor fragment M0: 0.0..0.3 s moving right at 100 px/s.
        for i in 0..4 {
            let ts = i as f64 * 0.1;
            let x = 100.0 + i as f64 * 10.0;
            out.extend(tracker.observe(ts, &[candidate(ts, x, 100.0, 240.0)], wall()));
        }
        // An unrelated slow object far away closes between the two meteor
        // fragments and lands in the pending list after M0.
        for i in 0..4 {
            let ts = 0.6 + i as f64 * 0.1;
            let x = 400.0 + i as f64;
            out.extend(tracker.observe(ts, &[candidate(ts, x, 300.0, 240.0)], wall()));
        }
        // Continuation fragment M1 resumes near M0's endpoint at the same
        // speed; it must merge with M0, not with whatever closed last.
        for i in 0..4 {
            let ts = 1.1 + i as f64 * 0.1;
            let x = 145.0 + i as f64 * 10.0;
            out.extend(tracker.observe(ts, &[candidate(ts, x, 100.0, 240.0)], wall()));
        }
        out.extend(tracker.observe(5.0, &[], wall()));
        out.extend(tracker.finalize_all());

        let event = single_event(out.clone());
        assert_eq!(event.start_point, (100, 100));
        assert_eq!(event.end_point, (175, 100));
        assert!((event.duration_s - 1.4).abs() < 1e-9);
        // The unrelated track finalises on its own and fails acceptance.
        let rejections = out
            .iter()
            .filter(|f| matches!(f, FinalizedTrack::Rejected { .. }))
            .count();
        assert_eq!(rejections, 1);
    }

    #[test]
    fn overlapping_tracks_never_merge() {
        let mut p = params();
        p.max_gap_time = 0.5;
        p.merge_max_gap_time = 1.5;

        let mut tracker = Tracker::new(p);
        let mut out = Vec::new();
        // Two objects moving in parallel over the same time range, close
        // enough that the merge distance and speed gates would both pass.
        for i in 0..4 {
            let ts = i as f64 * 0.1;
            let a = candidate(ts, 100.0 + i as f64 * 10.0, 100.0, 240.0);
            let b = candidate(ts, 100.0 + i as f64 * 10.0, 150.0, 240.0);
            out.extend(tracker.observe(ts, &[a, b], wall()));
        }
        out.extend(tracker.finalize_all());

        // Overlapping in time means two distinct objects: both finalise
        // separately; a merged pair would shuffle points out of time
        // order.
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn speed_mismatch_blocks_merge() {
        let mut p = params();
        p.max_gap_time = 0.5;
        p.merge_max_gap_time = 1.5;

        let mut tracker = Tracker::new(p);
        let mut out = Vec::new();
        // Fast fragment: 100 px/s, too short to stand on its own.
        for i in 0..3 {
            let ts = i as f64 * 0.1;
            out.extend(tracker.observe(
                ts,
                &[candidate(ts, 100.0 + i as f64 * 10.0, 100.0, 240.0)],
                wall(),
            ));
        }
        // Crawling fragment: 10 px/s, ratio 0.1 < 0.5.
        for i in 0..4 {
            let ts = 1.1 + i as f64 * 0.1;
            out.extend(tracker.observe(
                ts,
                &[candidate(ts, 140.0 + i as f64, 100.0, 240.0)],
                wall(),
            ));
        }
        out.extend(tracker.finalize_all());

        // Not merged: both fragments finalise separately, and neither
        // survives on its own merits.
        let rejections = out
            .iter()
            .filter(|f| matches!(f, FinalizedTrack::Rejected { .. }))
            .count();
        assert_eq!(rejections, 2);
        assert!(!out
            .iter()
            .any(|f| matches!(f, FinalizedTrack::Accepted(_))));
    }

    #[test]
    fn association_prefers_nearest_track() {
        let mut tracker = Tracker::new(params());
        // Seed two tracks far apart.
        tracker.observe(
            0.0,
            &[candidate(0.0, 100.0, 100.0, 240.0), candidate(0.0, 300.0, 100.0, 240.0)],
            wall(),
        );
        // A candidate near the first track extends it, not the second.
        tracker.observe(0.1, &[candidate(0.1, 110.0, 100.0, 240.0)], wall());
        let open = tracker.open_tracks();
        assert_eq!(open.len(), 2);
        let extended = open.iter().find(|t| t.points.len() == 2).unwrap();
        assert!((extended.points[0].x - 100.0).abs() < 1e-9);
    }

    #[test]
    fn far_candidate_seeds_new_track() {
        let mut tracker = Tracker::new(params());
        tracker.observe(0.0, &[candidate(0.0, 100.0, 100.0, 240.0)], wall());
        // 200 px away: beyond max_distance (80).
        tracker.observe(0.1, &[candidate(0.1, 300.0, 100.0, 240.0)], wall());
        assert_eq!(tracker.open_tracks().len(), 2);
    }

    #[test]
    fn confidence_formula() {
        // length 100, duration 0.5 s, speed 200, linearity 1, peak 240.
        let pts: Vec<(f64, f64, f64)> = (0..6)
            .map(|i| (i as f64 * 0.1, 100.0 + i as f64 * 20.0, 100.0))
            .collect();
        let event = single_event(run_track(params(), &pts));
        let expected = 0.25 + 0.20 + 0.25 + 0.20 * (240.0 / 255.0) + 0.5 * 0.002;
        assert!((event.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn finalize_all_flushes_open_tracks() {
        let mut tracker = Tracker::new(params());
        for i in 0..6 {
            let ts = i as f64 * 0.1;
            tracker.observe(
                ts,
                &[candidate(ts, 100.0 + i as f64 * 20.0, 100.0, 240.0)],
                wall(),
            );
        }
        assert!(tracker.has_open_tracks());
        let out = tracker.finalize_all();
        assert!(!tracker.has_open_tracks());
        single_event(out);
    }
}
