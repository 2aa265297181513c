//! LoRa airtime and retransmission timing
//!
//! The reliable router asks the transport how long to wait for an ack before
//! resending. That wait is derived from the packet's time on air under the
//! current modem preset, plus a contention window that grows with channel
//! utilization:
//!
//! ```text
//! delay = 2 * airtime
//!       + (2^cw + 2^((CW_MIN + CW_MAX) / 2)) * slot_time
//!       + PROCESSING_TIME
//!
//! cw = CW_MIN + (CW_MAX - CW_MIN) * utilization%
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Smallest contention window exponent
pub const CW_MIN: u32 = 2;
/// Largest contention window exponent
pub const CW_MAX: u32 = 8;
/// Time a peer may take to process a packet and queue its reply
pub const PROCESSING_TIME_MS: u64 = 4500;

/// Meshtastic-compatible modem presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModemPreset {
    /// Long range, fast: SF11, BW250, CR4/5
    #[default]
    LongFast,
    /// Long range, slow (maximum range): SF12, BW125, CR4/8
    LongSlow,
    /// Long range, moderate: SF11, BW125, CR4/8
    LongModerate,
    /// Medium range, fast: SF9, BW250, CR4/5
    MediumFast,
    /// Medium range, slow: SF10, BW250, CR4/5
    MediumSlow,
    /// Short range, fast (highest throughput): SF7, BW250, CR4/5
    ShortFast,
    /// Short range, slow: SF8, BW250, CR4/5
    ShortSlow,
}

impl ModemPreset {
    pub const ALL: [ModemPreset; 7] = [
        ModemPreset::LongFast,
        ModemPreset::LongSlow,
        ModemPreset::LongModerate,
        ModemPreset::MediumFast,
        ModemPreset::MediumSlow,
        ModemPreset::ShortFast,
        ModemPreset::ShortSlow,
    ];

    /// Get LoRa parameters for this preset
    pub fn lora_params(&self) -> (u8, u32, u8) {
        // Returns (spreading_factor, bandwidth_hz, coding_rate denominator)
        match self {
            ModemPreset::LongFast => (11, 250_000, 5),
            ModemPreset::LongSlow => (12, 125_000, 8),
            ModemPreset::LongModerate => (11, 125_000, 8),
            ModemPreset::MediumFast => (9, 250_000, 5),
            ModemPreset::MediumSlow => (10, 250_000, 5),
            ModemPreset::ShortFast => (7, 250_000, 5),
            ModemPreset::ShortSlow => (8, 250_000, 5),
        }
    }

    /// Preamble length (16 symbols)
    pub fn preamble_length() -> u8 {
        16
    }

    /// Parse a preset name such as `long-fast` or `LongFast`
    pub fn from_name(name: &str) -> Option<Self> {
        let key: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        ModemPreset::ALL
            .into_iter()
            .find(|p| format!("{:?}", p).to_ascii_lowercase() == key)
    }

    /// Symbol duration in milliseconds: 2^SF / BW
    pub fn symbol_time_ms(&self) -> f64 {
        let (sf, bw, _) = self.lora_params();
        (1u32 << sf) as f64 / bw as f64 * 1000.0
    }
}

/// Rolling channel utilization over a fixed window.
///
/// Timestamps are caller-supplied monotonic milliseconds so the tracker works
/// with both real and simulated clocks.
#[derive(Debug, Clone)]
pub struct ChannelUtilization {
    /// Recent activity: (start_ms, duration_ms)
    history: VecDeque<(u64, u64)>,
    window_ms: u64,
}

impl ChannelUtilization {
    pub fn new(window_secs: u64) -> Self {
        Self {
            history: VecDeque::new(),
            window_ms: window_secs * 1000,
        }
    }

    /// Record airtime (ours or overheard) starting at `now_ms`
    pub fn record(&mut self, now_ms: u64, airtime: Duration) {
        self.prune(now_ms);
        self.history.push_back((now_ms, airtime.as_millis() as u64));
    }

    /// Utilization in percent (0-100) as of `now_ms`
    pub fn percent(&self, now_ms: u64) -> f32 {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        let busy: u64 = self
            .history
            .iter()
            .filter(|(start, _)| *start >= cutoff)
            .map(|(_, d)| *d)
            .sum();
        (busy as f32 * 100.0 / self.window_ms as f32).min(100.0)
    }

    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while let Some((start, _)) = self.history.front() {
            if *start < cutoff {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for ChannelUtilization {
    fn default() -> Self {
        Self::new(60) // 1 minute window
    }
}

/// Airtime estimates and retransmission timing for one radio.
#[derive(Debug, Clone, Default)]
pub struct AirtimeModel {
    preset: ModemPreset,
    utilization: ChannelUtilization,
}

impl AirtimeModel {
    pub fn new(preset: ModemPreset) -> Self {
        Self {
            preset,
            utilization: ChannelUtilization::default(),
        }
    }

    pub fn preset(&self) -> ModemPreset {
        self.preset
    }

    /// Time on air for a frame of `len` bytes (explicit header, CRC on).
    pub fn airtime(&self, len: usize) -> Duration {
        let (sf, _bw, cr) = self.preset.lora_params();
        let t_sym = self.preset.symbol_time_ms();
        // Low data rate optimization kicks in for long symbols
        let de = if t_sym > 16.0 { 1.0 } else { 0.0 };
        let sf = sf as f64;

        let preamble_ms = (ModemPreset::preamble_length() as f64 + 4.25) * t_sym;
        let numerator = 8.0 * len as f64 - 4.0 * sf + 28.0 + 16.0;
        let payload_symbols =
            8.0 + ((numerator / (4.0 * (sf - 2.0 * de))).ceil() * cr as f64).max(0.0);

        Duration::from_micros(((preamble_ms + payload_symbols * t_sym) * 1000.0).round() as u64)
    }

    /// Contention slot: CAD duration plus propagation and MAC turnaround
    pub fn slot_time(&self) -> Duration {
        let (sf, bw, _) = self.preset.lora_params();
        let bw_khz = bw as f64 / 1000.0;
        let ms = 8.5 * (1u32 << sf) as f64 / bw_khz + 0.2 + 0.4 + 7.0;
        Duration::from_micros((ms * 1000.0).round() as u64)
    }

    /// Contention window exponent for the utilization seen at `now_ms`
    pub fn contention_window(&self, now_ms: u64) -> u32 {
        let util = self.utilization.percent(now_ms);
        CW_MIN + ((CW_MAX - CW_MIN) as f32 * util / 100.0).round() as u32
    }

    /// How long to wait for an ack of a `len`-byte frame sent at `now_ms`
    pub fn retransmission_delay(&self, len: usize, now_ms: u64) -> Duration {
        let cw = self.contention_window(now_ms);
        let slots = (1u32 << cw) + (1u32 << ((CW_MAX + CW_MIN) / 2));
        2 * self.airtime(len)
            + self.slot_time() * slots
            + Duration::from_millis(PROCESSING_TIME_MS)
    }

    /// Account for channel activity (own transmissions or overheard frames)
    pub fn record_activity(&mut self, now_ms: u64, airtime: Duration) {
        self.utilization.record(now_ms, airtime);
    }

    pub fn utilization_percent(&self, now_ms: u64) -> f32 {
        self.utilization.percent(now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modem_preset_params() {
        let (sf, bw, _cr) = ModemPreset::LongFast.lora_params();
        assert_eq!(sf, 11);
        assert_eq!(bw, 250_000);
        assert_eq!(ModemPreset::default(), ModemPreset::LongFast);
    }

    #[test]
    fn test_preset_from_name() {
        assert_eq!(ModemPreset::from_name("long-fast"), Some(ModemPreset::LongFast));
        assert_eq!(ModemPreset::from_name("ShortSlow"), Some(ModemPreset::ShortSlow));
        assert_eq!(ModemPreset::from_name("bogus"), None);
    }

    #[test]
    fn test_airtime_grows_with_size_and_sf() {
        let fast = AirtimeModel::new(ModemPreset::ShortFast);
        let slow = AirtimeModel::new(ModemPreset::LongSlow);

        assert!(fast.airtime(100) > fast.airtime(10));
        assert!(slow.airtime(50) > fast.airtime(50));

        // LongFast, 32 bytes: roughly a few hundred milliseconds
        let long_fast = AirtimeModel::new(ModemPreset::LongFast).airtime(32);
        assert!(long_fast > Duration::from_millis(200));
        assert!(long_fast < Duration::from_millis(600));
    }

    #[test]
    fn test_channel_utilization_window() {
        let mut util = ChannelUtilization::new(10);
        util.record(0, Duration::from_millis(1000));
        util.record(5_000, Duration::from_millis(1000));
        assert!((util.percent(5_000) - 20.0).abs() < 0.01);

        // First entry has aged out
        assert!((util.percent(12_000) - 10.0).abs() < 0.01);
        assert_eq!(util.percent(30_000), 0.0);
    }

    #[test]
    fn test_retransmission_delay_scales_with_utilization() {
        let mut model = AirtimeModel::new(ModemPreset::LongFast);
        let idle = model.retransmission_delay(40, 0);
        assert_eq!(model.contention_window(0), CW_MIN);
        assert!(idle > Duration::from_millis(PROCESSING_TIME_MS));

        assert_eq!(model.utilization_percent(0), 0.0);
        model.record_activity(1_000, Duration::from_secs(30));
        assert!((model.utilization_percent(1_000) - 50.0).abs() < 0.01);
        assert!(model.contention_window(1_000) > CW_MIN);
        assert!(model.retransmission_delay(40, 1_000) > idle);
    }
}
