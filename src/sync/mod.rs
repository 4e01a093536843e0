//! Meter clock drift measurement and correction.

pub mod clock;

use crate::meter::registers::{CLOCK_BASE, CLOCK_WORDS};
use crate::meter::time::{decode_clock, encode_clock, TimeError};
use crate::retry::Retrier;
use crate::transport::{RegisterTransport, TransportError};
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};

pub const DEFAULT_ALLOWED_DRIFT_SECONDS: u32 = 60;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("meter clock error: {0}")]
    Time(#[from] TimeError),

    #[error(
        "meter clock still off by {:.1}s after correction (allowed {allowed_seconds}s)",
        .after.drift_seconds
    )]
    SyncFailed {
        before: DriftMeasurement,
        after: DriftMeasurement,
        allowed_seconds: u32,
    },
}

/// One comparison of the meter clock against the host clock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftMeasurement {
    pub meter_time: NaiveDateTime,
    /// Midpoint of the host readings taken around the register read.
    pub host_time: NaiveDateTime,
    /// `meter_time - host_time`; positive when the meter runs ahead.
    pub drift_seconds: f64,
    pub round_trip_ms: i64,
}

impl DriftMeasurement {
    pub fn exceeds(&self, allowed_seconds: u32) -> bool {
        self.drift_seconds.abs() > allowed_seconds as f64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncPolicy {
    pub allowed_drift_seconds: u32,
    /// Write the host time to the meter when drift is out of tolerance.
    /// Without it the meter is never written to.
    pub auto_sync: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            allowed_drift_seconds: DEFAULT_ALLOWED_DRIFT_SECONDS,
            auto_sync: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub measured: DriftMeasurement,
    /// Re-measurement after the meter clock was written, if it was.
    pub corrected: Option<DriftMeasurement>,
    pub allowed_drift_seconds: u32,
}

impl SyncOutcome {
    pub fn correction_attempted(&self) -> bool {
        self.corrected.is_some()
    }

    pub fn within_tolerance(&self) -> bool {
        let latest = self.corrected.as_ref().unwrap_or(&self.measured);
        !latest.exceeds(self.allowed_drift_seconds)
    }
}

fn compare(
    before: NaiveDateTime,
    words: &[u16],
    after: NaiveDateTime,
) -> Result<DriftMeasurement, SyncError> {
    let meter_time = decode_clock(words)?;
    let round_trip = after - before;
    let host_time = before + round_trip / 2;

    Ok(DriftMeasurement {
        meter_time,
        host_time,
        drift_seconds: (meter_time - host_time).num_milliseconds() as f64 / 1000.0,
        round_trip_ms: round_trip.num_milliseconds(),
    })
}

pub struct TimeSync {
    clock: Arc<dyn Clock>,
    policy: SyncPolicy,
}

impl TimeSync {
    pub fn new(clock: Arc<dyn Clock>, policy: SyncPolicy) -> Self {
        Self { clock, policy }
    }

    /// Read the meter clock, bracketed by two host readings.
    async fn measure<T>(&self, transport: &mut T, retrier: &mut Retrier) -> Result<DriftMeasurement, SyncError>
    where
        T: RegisterTransport + ?Sized,
    {
        let clock = self.clock.clone();
        let (before, words, after) = retrier
            .run(transport, "read meter clock", move |t| {
                let clock = clock.clone();
                Box::pin(async move {
                    let before = clock.local();
                    let words = t.read_registers(CLOCK_BASE, CLOCK_WORDS).await?;
                    Ok((before, words, clock.local()))
                })
            })
            .await?;
        compare(before, &words, after)
    }

    /// Measure drift and, when it is out of tolerance and the policy allows,
    /// set the meter clock to host time and confirm the result.
    ///
    /// The clock is written in a single six-register transfer and never
    /// retried; a failed confirmation is reported as [`SyncError::SyncFailed`].
    pub async fn check_and_sync<T>(
        &self,
        transport: &mut T,
        retrier: &mut Retrier,
    ) -> Result<SyncOutcome, SyncError>
    where
        T: RegisterTransport + ?Sized,
    {
        let allowed = self.policy.allowed_drift_seconds;
        let measured = self.measure(transport, retrier).await?;

        tracing::info!(
            meter = %measured.meter_time,
            host = %measured.host_time,
            drift_s = measured.drift_seconds,
            allowed_s = allowed,
            "Time drift check"
        );

        if !measured.exceeds(allowed) {
            tracing::info!("Drift within limits, no sync required");
            return Ok(SyncOutcome {
                measured,
                corrected: None,
                allowed_drift_seconds: allowed,
            });
        }

        if !self.policy.auto_sync {
            tracing::warn!(
                drift_s = measured.drift_seconds,
                allowed_s = allowed,
                "Drift exceeds allowed limit, automatic sync disabled"
            );
            return Ok(SyncOutcome {
                measured,
                corrected: None,
                allowed_drift_seconds: allowed,
            });
        }

        // Round to the nearest whole second; the clock registers hold no fraction.
        let target = self.clock.local() + ChronoDuration::milliseconds(500);
        let words = encode_clock(&target)?;
        tracing::info!(target = %target.format("%Y-%m-%d %H:%M:%S"), "Writing meter clock");
        transport.write_registers(CLOCK_BASE, &words).await?;

        let after = self.measure(transport, retrier).await?;
        if after.exceeds(allowed) {
            tracing::error!(drift_s = after.drift_seconds, "Meter clock did not take the correction");
            return Err(SyncError::SyncFailed {
                before: measured,
                after,
                allowed_seconds: allowed,
            });
        }

        tracing::info!(drift_s = after.drift_seconds, "Meter clock synchronized");
        Ok(SyncOutcome {
            measured,
            corrected: Some(after),
            allowed_drift_seconds: allowed,
        })
    }
}
