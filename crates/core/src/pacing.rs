//! Playback-rate pacing.
//!
//! The first sample fixes an anchor `(first_wall_us, first_media_us)`.
//! Every later sample with media time `t` is due at
//!
//! ```text
//! when = first_wall_us + (t - first_media_us)
//! ```
//!
//! Deadlines are always derived from the anchor, never from the previous
//! sample's delay, so scheduling jitter in the loop does not accumulate:
//! a late dispatch only shortens the next delay (possibly below zero, which
//! the looper treats as "now").

/// Wall-clock / media-time pair fixed at the first sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub first_wall_us: i64,
    pub first_media_us: i64,
}

/// Delivery deadline for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// Absolute wall-clock delivery time, in microseconds.
    pub when_us: i64,
    /// `when_us - now_us`; negative when the loop is running behind.
    pub delay_us: i64,
}

#[derive(Debug, Default)]
pub struct Pacer {
    anchor: Option<Anchor>,
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anchor(&self) -> Option<Anchor> {
        self.anchor
    }

    /// Compute the deadline for a sample with media time `media_us`,
    /// fetched at wall-clock time `now_us`.
    pub fn schedule(&mut self, media_us: i64, now_us: i64) -> Deadline {
        let anchor = *self.anchor.get_or_insert_with(|| {
            tracing::debug!(first_wall_us = now_us, first_media_us = media_us, "pacing anchored");
            Anchor {
                first_wall_us: now_us,
                first_media_us: media_us,
            }
        });

        let when_us = anchor.first_wall_us + (media_us - anchor.first_media_us);
        Deadline {
            when_us,
            delay_us: when_us - now_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_immediate() {
        let mut pacer = Pacer::new();
        let d = pacer.schedule(500_000, 1_234);
        assert_eq!(d.delay_us, 0);
        assert_eq!(d.when_us, 1_234);
        assert_eq!(
            pacer.anchor(),
            Some(Anchor {
                first_wall_us: 1_234,
                first_media_us: 500_000
            })
        );
    }

    #[test]
    fn deadlines_track_media_offsets_regardless_of_dispatch_time() {
        let mut pacer = Pacer::new();
        let media = [0i64, 33_366, 66_733, 100_100, 100_100, 133_466];
        // Fetch times with arbitrary jitter, including falling behind.
        let fetched = [10_000i64, 12_000, 80_000, 200_000, 200_500, 140_000];

        let first = pacer.schedule(media[0], fetched[0]);
        for (&t, &now) in media.iter().zip(&fetched).skip(1) {
            let d = pacer.schedule(t, now);
            assert_eq!(d.when_us - first.when_us, t - media[0]);
            assert_eq!(d.delay_us, d.when_us - now);
        }
    }

    #[test]
    fn non_decreasing_media_times_give_non_decreasing_deadlines() {
        let mut pacer = Pacer::new();
        let mut last = i64::MIN;
        let mut now = 0;
        for t in (0..50).map(|i| i * 40_000 / 3) {
            now += 7_000;
            let d = pacer.schedule(t, now);
            assert!(d.when_us >= last);
            last = d.when_us;
        }
    }

    #[test]
    fn late_fetch_yields_negative_delay() {
        let mut pacer = Pacer::new();
        pacer.schedule(0, 0);
        let d = pacer.schedule(33_000, 50_000);
        assert_eq!(d.when_us, 33_000);
        assert_eq!(d.delay_us, -17_000);
    }

    #[test]
    fn nonzero_first_media_time_is_offset() {
        let mut pacer = Pacer::new();
        pacer.schedule(9_000_000, 100);
        let d = pacer.schedule(9_033_000, 100);
        assert_eq!(d.when_us, 33_100);
        assert_eq!(d.delay_us, 33_000);
    }
}
