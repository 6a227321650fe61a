//! Sunrise ramp: dim red to bright white
//!
//! Brightness follows `floor(t² × 253) + 1`. Color follows a quadratic Bézier
//! in CIE xy from deep red, bending through orange, to the D65 white point.
//! One light update goes out per tick. Ticks run on a fixed cadence, so a slow
//! or lost update never pushes the next one back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use threadfree_proto::payload::{LightControl, LightState, light_path};
use tokio::time::{Instant, MissedTickBehavior};

use crate::channel::SecureChannel;
use crate::exchange::{Exchange, Request};
use crate::{Error, Result};

/// Full scale of the hub's 16-bit chromaticity coordinates
pub const CIE_SCALE: f64 = 65535.0;

pub const MIN_BRIGHTNESS: u8 = 1;
pub const MAX_BRIGHTNESS: u8 = 254;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chromaticity {
    pub x: f64,
    pub y: f64,
}

impl Chromaticity {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn lerp(self, to: Self, t: f64) -> Self {
        Self {
            x: self.x + (to.x - self.x) * t,
            y: self.y + (to.y - self.y) * t,
        }
    }

    /// Truncate to the hub's integer coordinates
    pub fn quantize(self) -> (u16, u16) {
        (self.x as u16, self.y as u16)
    }
}

/// Quadratic Bézier through three control points
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorPath {
    pub start: Chromaticity,
    pub mid: Chromaticity,
    pub end: Chromaticity,
}

impl ColorPath {
    pub fn sunrise() -> Self {
        let start = Chromaticity::new(0.7347 * CIE_SCALE, 0.2653 * CIE_SCALE);
        let mid = Chromaticity::new(start.x - 0.2 * CIE_SCALE, start.y + 0.2 * CIE_SCALE);
        let end = Chromaticity::new(0.312713 * CIE_SCALE, 0.329016 * CIE_SCALE);
        Self { start, mid, end }
    }

    pub fn at(&self, t: f64) -> Chromaticity {
        let near = self.start.lerp(self.mid, t);
        let far = self.mid.lerp(self.end, t);
        near.lerp(far, t)
    }
}

impl Default for ColorPath {
    fn default() -> Self {
        Self::sunrise()
    }
}

pub fn brightness_at(t: f64) -> u8 {
    let t = t.clamp(0.0, 1.0);
    let level = (t * t * 253.0).floor() as u8 + 1;
    level.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS)
}

/// Fraction of the ramp covered after `elapsed`, never below zero.
/// A zero-length ramp is already over.
pub fn progress(elapsed: Duration, duration: Duration) -> f64 {
    if duration.is_zero() {
        return 1.0;
    }
    elapsed.as_secs_f64() / duration.as_secs_f64()
}

/// Light state for one point on the ramp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampState {
    pub t: f64,
    pub brightness: u8,
    pub cie_x: u16,
    pub cie_y: u16,
}

impl RampState {
    pub fn at(t: f64) -> Self {
        Self::on_path(&ColorPath::sunrise(), t)
    }

    pub fn on_path(path: &ColorPath, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);
        let (cie_x, cie_y) = path.at(t).quantize();
        Self {
            t,
            brightness: brightness_at(t),
            cie_x,
            cie_y,
        }
    }

    pub fn light_control(&self) -> LightControl {
        LightControl::single(LightState {
            on: 1,
            dimmer: self.brightness,
            color_x: self.cie_x,
            color_y: self.cie_y,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RampConfig {
    pub duration: Duration,
    pub tick: Duration,
    pub request_timeout: Duration,
}

impl RampConfig {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ..Self::default()
        }
    }

    /// Per-request wait, never longer than one tick
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout.min(self.tick)
    }
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(1800),
            tick: Duration::from_secs(1),
            request_timeout: Duration::from_millis(900),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampPhase {
    NotStarted,
    Ramping,
    Complete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RampSummary {
    /// Updates sent
    pub ticks: u32,
    /// Updates that timed out, failed or were rejected
    pub failures: u32,
    pub cancelled: bool,
}

pub struct RampController {
    exchange: Arc<dyn Exchange>,
    path: String,
    config: RampConfig,
    color: ColorPath,
    phase: RampPhase,
}

impl RampController {
    pub fn new(exchange: Arc<dyn Exchange>, lamp_id: &str, config: RampConfig) -> Result<Self> {
        if lamp_id.is_empty() || !lamp_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::argument(format!("lamp id must be numeric, got {lamp_id:?}")));
        }
        if config.tick.is_zero() {
            return Err(Error::argument("tick interval must be positive"));
        }
        Ok(Self {
            exchange,
            path: light_path(lamp_id),
            config,
            color: ColorPath::sunrise(),
            phase: RampPhase::NotStarted,
        })
    }

    pub fn with_color_path(mut self, color: ColorPath) -> Self {
        self.color = color;
        self
    }

    pub fn phase(&self) -> RampPhase {
        self.phase
    }

    /// Drive the ramp until it completes or `shutdown` resolves.
    ///
    /// Failed updates are logged and counted, never fatal.
    pub async fn run<F>(&mut self, channel: &mut dyn SecureChannel, shutdown: F) -> RampSummary
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut summary = RampSummary::default();
        self.phase = RampPhase::Ramping;
        tracing::info!(
            path = %self.path,
            duration = ?self.config.duration,
            tick = ?self.config.tick,
            "starting ramp"
        );

        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    summary.cancelled = true;
                    break;
                }
                _ = ticker.tick() => {}
            }

            let t = progress(started.elapsed(), self.config.duration);
            if t >= 1.0 {
                break;
            }
            let state = RampState::on_path(&self.color, t);
            summary.ticks += 1;

            let applied = tokio::select! {
                _ = &mut shutdown => {
                    summary.cancelled = true;
                    break;
                }
                applied = self.apply(channel, &state) => applied,
            };
            if !applied {
                summary.failures += 1;
            }
        }

        self.phase = RampPhase::Complete;
        tracing::info!(
            ticks = summary.ticks,
            failures = summary.failures,
            cancelled = summary.cancelled,
            "ramp finished"
        );
        summary
    }

    async fn apply(&self, channel: &mut dyn SecureChannel, state: &RampState) -> bool {
        let request = match Request::put(&self.path).json(&state.light_control()) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("could not encode light update: {e}");
                return false;
            }
        };

        let timeout = self.config.request_timeout();
        let reply = tokio::time::timeout(timeout, self.exchange.request(channel, &request, timeout)).await;
        match reply {
            Ok(Ok(Some(response))) if response.code.is_success() => {
                tracing::debug!(
                    t = state.t,
                    brightness = state.brightness,
                    x = state.cie_x,
                    y = state.cie_y,
                    "light updated"
                );
                true
            }
            Ok(Ok(Some(response))) => {
                tracing::warn!(
                    code = %response.code,
                    body = %response.payload_text(),
                    "hub rejected light update"
                );
                false
            }
            Ok(Ok(None)) | Err(_) => {
                tracing::warn!(?timeout, "light update timed out");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!("light update failed: {e}");
                false
            }
        }
    }
}
