//! # Clock
//!
//! Injected time source. The pipeline never reads wall-clock time directly,
//! which keeps timestamp-sensitive behavior (field stamps, merge audit
//! entries, lock TTLs) deterministic under test.

use parking_lot::Mutex;
use time::OffsetDateTime;

/// Epoch timestamp in seconds with sub-second precision.
///
/// Field-level change stamps need finer than one-second resolution because
/// several mutations of the same profile routinely land within one request.
pub type Stamp = f64;

/// Time source injected into the resolution and deduplication pipeline.
pub trait Clock: Send + Sync {
    /// Current instant as epoch seconds.
    fn now(&self) -> Stamp;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Stamp {
        OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
    }
}

/// Settable clock for tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<Stamp>,
}

impl FixedClock {
    pub fn new(at: Stamp) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: Stamp) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: f64) {
        *self.now.lock() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Stamp {
        *self.now.lock()
    }
}

/// Shared handles tell the same time as the clock they wrap, so a test can
/// keep advancing a clock it has already handed to the pipeline.
impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Stamp {
        (**self).now()
    }
}
