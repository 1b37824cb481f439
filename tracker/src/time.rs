use time::OffsetDateTime;

pub trait TimeSource {
    // Wall-clock "now"; the ranking window is evaluated against this.
    fn current_time(&self) -> OffsetDateTime;
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Time source pinned to a fixed instant, for tests that need
/// reproducible window arithmetic.
#[derive(Clone)]
pub struct FixedTime {
    pub time: OffsetDateTime,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> OffsetDateTime {
        self.time
    }
}
