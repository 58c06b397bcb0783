//! Wheel pulse capture
//!
//! Edges arrive from the GPIO layer on its own execution context. The
//! per-wheel counters sit behind a single mutex; every reader copies what it
//! needs out of the lock and does its arithmetic afterwards.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::info;

use crate::config::EncoderConfig;
use crate::messages::now_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wheel {
    Left,
    Right,
}

/// Commanded rotation sense of a wheel
///
/// Single-channel encoders cannot sense direction, so the motor driver
/// reports it and signed positions follow the commanded sense.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WheelDirection {
    #[default]
    Forward,
    Reverse,
}

impl WheelDirection {
    fn sign(self) -> i64 {
        match self {
            Self::Forward => 1,
            Self::Reverse => -1,
        }
    }
}

/// Snapshot of both encoders
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EncoderData {
    /// Raw pulse counts, monotonically increasing until reset
    pub left_pulses: u64,
    pub right_pulses: u64,
    /// Signed wheel surface speed (m/s)
    pub left_velocity: f64,
    pub right_velocity: f64,
    pub timestamp: f64,
}

/// Signed pulse deltas since the previous read
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PulseDelta {
    pub left: i64,
    pub right: i64,
    /// Elapsed time since the previous read (s)
    pub dt: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncoderStatus {
    pub left_pulses: u64,
    pub right_pulses: u64,
    pub left_velocity: f64,
    pub right_velocity: f64,
    pub pulses_per_meter: f64,
    pub wheel_radius: f64,
    pub wheel_base: f64,
    pub pulses_per_revolution: u32,
}

#[derive(Debug, Default)]
struct WheelChannel {
    pulses: u64,
    position: i64,
    last_read_position: i64,
    direction: WheelDirection,
    level: bool,
    last_pulse: Option<Instant>,
    pulse_times: VecDeque<Instant>,
}

#[derive(Debug)]
struct Counters {
    left: WheelChannel,
    right: WheelChannel,
    last_read: Instant,
}

impl Counters {
    fn channel(&mut self, wheel: Wheel) -> &mut WheelChannel {
        match wheel {
            Wheel::Left => &mut self.left,
            Wheel::Right => &mut self.right,
        }
    }
}

/// Differential-drive wheel encoder pair
pub struct EncoderReader {
    config: EncoderConfig,
    counters: Mutex<Counters>,
}

impl EncoderReader {
    pub fn new(config: EncoderConfig) -> Self {
        info!(
            ppr = config.pulses_per_revolution,
            wheel_radius = config.wheel_radius,
            "encoder reader initialized"
        );
        Self {
            config,
            counters: Mutex::new(Counters {
                left: WheelChannel::default(),
                right: WheelChannel::default(),
                last_read: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Feed a raw level transition from the GPIO layer
    pub fn on_edge(&self, wheel: Wheel, level: bool) {
        self.on_edge_at(wheel, level, Instant::now());
    }

    /// Feed a level transition observed at `at`; rising edges count as pulses
    pub fn on_edge_at(&self, wheel: Wheel, level: bool, at: Instant) {
        let debounce = self.config.debounce();
        let window = self.config.velocity_window;
        let mut counters = self.counters.lock();
        let channel = counters.channel(wheel);
        let rising = level && !channel.level;
        channel.level = level;
        if rising {
            Self::count_pulse(channel, at, debounce, window);
        }
    }

    /// Record one pulse whose edge was already detected upstream
    pub fn record_pulse_at(&self, wheel: Wheel, at: Instant) {
        let debounce = self.config.debounce();
        let window = self.config.velocity_window;
        let mut counters = self.counters.lock();
        Self::count_pulse(counters.channel(wheel), at, debounce, window);
    }

    fn count_pulse(
        channel: &mut WheelChannel,
        at: Instant,
        debounce: std::time::Duration,
        window: usize,
    ) {
        if let Some(last) = channel.last_pulse {
            if at.saturating_duration_since(last) < debounce {
                return;
            }
        }
        channel.last_pulse = Some(at);
        channel.pulses += 1;
        channel.position += channel.direction.sign();
        channel.pulse_times.push_back(at);
        while channel.pulse_times.len() > window {
            channel.pulse_times.pop_front();
        }
    }

    /// Set the commanded rotation sense used to sign future pulses
    pub fn set_direction(&self, wheel: Wheel, direction: WheelDirection) {
        self.counters.lock().channel(wheel).direction = direction;
    }

    pub fn direction(&self, wheel: Wheel) -> WheelDirection {
        self.counters.lock().channel(wheel).direction
    }

    pub fn encoder_data(&self) -> EncoderData {
        self.encoder_data_at(Instant::now())
    }

    pub fn encoder_data_at(&self, now: Instant) -> EncoderData {
        let (left_pulses, right_pulses, left_times, right_times, left_dir, right_dir) = {
            let counters = self.counters.lock();
            (
                counters.left.pulses,
                counters.right.pulses,
                counters.left.pulse_times.clone(),
                counters.right.pulse_times.clone(),
                counters.left.direction,
                counters.right.direction,
            )
        };

        EncoderData {
            left_pulses,
            right_pulses,
            left_velocity: self.window_velocity(&left_times, now) * left_dir.sign() as f64,
            right_velocity: self.window_velocity(&right_times, now) * right_dir.sign() as f64,
            timestamp: now_secs(),
        }
    }

    /// Signed pulses since the previous call, and the elapsed time
    pub fn incremental(&self) -> PulseDelta {
        self.incremental_at(Instant::now())
    }

    pub fn incremental_at(&self, now: Instant) -> PulseDelta {
        let mut counters = self.counters.lock();
        let left = counters.left.position - counters.left.last_read_position;
        let right = counters.right.position - counters.right.last_read_position;
        counters.left.last_read_position = counters.left.position;
        counters.right.last_read_position = counters.right.position;
        let dt = now.saturating_duration_since(counters.last_read).as_secs_f64();
        counters.last_read = now;
        PulseDelta { left, right, dt }
    }

    pub fn reset_counters(&self) {
        {
            let mut counters = self.counters.lock();
            for wheel in [Wheel::Left, Wheel::Right] {
                let channel = counters.channel(wheel);
                let direction = channel.direction;
                *channel = WheelChannel {
                    direction,
                    ..WheelChannel::default()
                };
            }
            counters.last_read = Instant::now();
        }
        info!("encoder counters reset");
    }

    pub fn pulses_per_meter(&self) -> f64 {
        self.config.pulses_per_revolution as f64 / self.config.wheel_circumference()
    }

    /// Convert a signed pulse count into wheel travel (m)
    pub fn pulses_to_distance(&self, pulses: i64) -> f64 {
        pulses as f64 / self.config.pulses_per_revolution as f64
            * self.config.wheel_circumference()
    }

    /// Surface speed from the recent pulse window (m/s, unsigned)
    fn window_velocity(&self, times: &VecDeque<Instant>, now: Instant) -> f64 {
        let max_age = self.config.velocity_max_age;
        let valid: Vec<Instant> = times
            .iter()
            .copied()
            .filter(|t| now.saturating_duration_since(*t).as_secs_f64() <= max_age)
            .collect();

        let (Some(first), Some(last)) = (valid.first(), valid.last()) else {
            return 0.0;
        };
        if valid.len() < 2 {
            return 0.0;
        }
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }

        let revolutions_per_sec =
            (valid.len() - 1) as f64 / self.config.pulses_per_revolution as f64 / span;
        revolutions_per_sec * self.config.wheel_circumference()
    }

    pub fn status(&self) -> EncoderStatus {
        let data = self.encoder_data();
        EncoderStatus {
            left_pulses: data.left_pulses,
            right_pulses: data.right_pulses,
            left_velocity: data.left_velocity,
            right_velocity: data.right_velocity,
            pulses_per_meter: self.pulses_per_meter(),
            wheel_radius: self.config.wheel_radius,
            wheel_base: self.config.wheel_base,
            pulses_per_revolution: self.config.pulses_per_revolution,
        }
    }
}
