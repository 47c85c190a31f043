use std::cmp::Ordering;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Wall-clock instant with nanosecond precision.
///
/// `nanos` is always normalized into `0..1_000_000_000`, so instants before
/// the epoch carry a negative `seconds` with a positive nanosecond offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i64) -> Self {
        let extra_seconds = nanos.div_euclid(NANOS_PER_SECOND);
        let nanos = nanos.rem_euclid(NANOS_PER_SECOND);
        Self {
            seconds: seconds + extra_seconds,
            nanos: nanos as i32,
        }
    }

    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self::new(now.timestamp(), i64::from(now.timestamp_subsec_nanos()))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then(self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
