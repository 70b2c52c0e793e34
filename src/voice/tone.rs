//! Connect tone rendering.

use crate::config::ToneConfig;

/// Level the fade reaches at the end of the tone.
const FADE_FLOOR: f32 = 0.0001;

/// Render the connect tone: a sine at `frequency_hz` whose gain decays
/// exponentially from `gain` to 0.0001 over `duration_ms`.
pub fn render_tone(config: &ToneConfig) -> Vec<f32> {
    let sample_rate = config.sample_rate.max(1) as f32;
    let len = (u64::from(config.sample_rate) * u64::from(config.duration_ms) / 1000) as usize;
    if len == 0 || config.gain <= 0.0 {
        return Vec::new();
    }

    let start = config.gain.max(FADE_FLOOR);
    let ratio = FADE_FLOOR / start;
    let last = (len.saturating_sub(1)).max(1) as f32;
    let step = std::f32::consts::TAU * config.frequency_hz / sample_rate;

    (0..len)
        .map(|i| {
            let t = i as f32;
            let envelope = start * ratio.powf(t / last);
            envelope * (step * t).sin()
        })
        .collect()
}
