use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use std::sync::Mutex;

/// Host time source. Meter clocks run on local wall-clock time, so `local`
/// is the frame drift and collection windows are measured in; `utc` stamps
/// persisted bookkeeping.
pub trait Clock: Send + Sync {
    fn local(&self) -> NaiveDateTime;

    fn utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. The local frame is treated as UTC.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn local(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn utc(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.local())
    }
}
