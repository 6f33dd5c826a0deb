//! Playback-synchronized progress timestamps (C11, timestamp algebra per §4.9).

/// The session's current wall-clock anchor: "at wall time `ts_ms`, the RTP
/// sample being played is `pos`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClockAnchor {
    /// Monotonic wall-clock time, in milliseconds.
    pub ts_ms: i64,
    /// RTP position (sample units) at `ts_ms`.
    pub pos: i64,
}

/// A metadata item's own timing, as reported by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackTimestamp {
    /// Monotonic time the player captured this position at, in milliseconds.
    pub pts_ms: i64,
    /// Track position at `pts_ms`, in milliseconds.
    pub pos_ms: i64,
    /// Track length, in milliseconds (0 if unknown/unbounded).
    pub len_ms: i64,
    /// True on item start or quality switch; selects the startup display
    /// delay (15360 samples) over the steady-state one (30720 samples).
    pub startup: bool,
}

/// Computed RTP-position triple for a `progress:` `SET_PARAMETER` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackProgress {
    /// Display position: where the UI should show playback as being.
    pub display: i64,
    /// Current RTP position, never behind the wall-clock anchor.
    pub pos: i64,
    /// End-of-track RTP position (equal to `pos` if length is unknown).
    pub end: i64,
}

impl PlaybackProgress {
    /// Derive display/pos/end from the session's wall-clock anchor and a
    /// track's self-reported timing, per §4.9's signed-64 arithmetic.
    #[must_use]
    pub fn compute(cur_stamp: WallClockAnchor, track: TrackTimestamp, sample_rate: i64) -> Self {
        let diff_ms = cur_stamp.ts_ms - track.pts_ms;
        let elapsed_ms = track.pos_ms + diff_ms;
        let elapsed_samples = elapsed_ms * sample_rate / 1000;
        let start = cur_stamp.pos - elapsed_samples;
        let delay = if track.startup { 15_360 } else { 30_720 };
        let display = start - delay;
        let pos_out = cur_stamp.pos.max(start);
        let len_samples = track.len_ms * sample_rate / 1000;
        let end = if len_samples != 0 {
            start + len_samples
        } else {
            pos_out
        };

        Self {
            display,
            pos: pos_out,
            end,
        }
    }

    /// Encode as the `text/parameters` `progress:` body.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("progress: {}/{}/{}\r\n", self.display, self.pos, self.end)
    }

    /// Parse a `progress:` body back into its triple.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let line = text.lines().find(|l| l.starts_with("progress:"))?;
        let values = line.strip_prefix("progress:")?.trim();
        let mut parts = values.split('/');

        Some(Self {
            display: parts.next()?.trim().parse().ok()?,
            pos: parts.next()?.trim().parse().ok()?,
            end: parts.next()?.trim().parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_state_delay_is_30720_samples() {
        let cur_stamp = WallClockAnchor {
            ts_ms: 1_000,
            pos: 44_100,
        };
        let track = TrackTimestamp {
            pts_ms: 1_000,
            pos_ms: 0,
            len_ms: 0,
            startup: false,
        };
        let progress = PlaybackProgress::compute(cur_stamp, track, 44_100);
        assert_eq!(progress.display, progress.pos - 30_720);
    }

    #[test]
    fn startup_delay_is_15360_samples() {
        let cur_stamp = WallClockAnchor {
            ts_ms: 1_000,
            pos: 44_100,
        };
        let track = TrackTimestamp {
            pts_ms: 1_000,
            pos_ms: 0,
            len_ms: 0,
            startup: true,
        };
        let progress = PlaybackProgress::compute(cur_stamp, track, 44_100);
        assert_eq!(progress.display, progress.pos - 15_360);
    }

    #[test]
    fn pos_never_goes_behind_wall_clock_anchor() {
        let cur_stamp = WallClockAnchor {
            ts_ms: 1_000,
            pos: 100,
        };
        let track = TrackTimestamp {
            pts_ms: 0,
            pos_ms: 0,
            len_ms: 0,
            startup: false,
        };
        let progress = PlaybackProgress::compute(cur_stamp, track, 44_100);
        assert_eq!(progress.pos, cur_stamp.pos);
    }

    #[test]
    fn end_falls_back_to_pos_when_length_unknown() {
        let cur_stamp = WallClockAnchor {
            ts_ms: 1_000,
            pos: 44_100,
        };
        let track = TrackTimestamp {
            pts_ms: 1_000,
            pos_ms: 0,
            len_ms: 0,
            startup: false,
        };
        let progress = PlaybackProgress::compute(cur_stamp, track, 44_100);
        assert_eq!(progress.end, progress.pos);
    }

    #[test]
    fn end_uses_length_when_known() {
        let cur_stamp = WallClockAnchor {
            ts_ms: 1_000,
            pos: 44_100,
        };
        let track = TrackTimestamp {
            pts_ms: 1_000,
            pos_ms: 0,
            len_ms: 10_000,
            startup: false,
        };
        let progress = PlaybackProgress::compute(cur_stamp, track, 44_100);
        let start = progress.pos; // pos_ms=0, diff computed from same instant
        assert_eq!(progress.end, start + 441_000);
    }

    #[test]
    fn encode_parse_round_trip() {
        let progress = PlaybackProgress {
            display: 10,
            pos: 20,
            end: 30,
        };
        let encoded = progress.encode();
        assert_eq!(encoded, "progress: 10/20/30\r\n");
        assert_eq!(PlaybackProgress::parse(&encoded), Some(progress));
    }
}
