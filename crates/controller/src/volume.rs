//! Effective watering volume after rain and ground-moisture attenuation.

use serde::Deserialize;

use crate::settings::ChannelConfig;

/// How attenuation percentages are applied to the target volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeRounding {
    /// `target * rain * ground / 10_000`, truncated once at the end.
    #[default]
    Exact,
    /// Each percentage is divided by 100 before multiplying, so any factor
    /// below 100 % zeroes the volume. Matches older controller firmware.
    Legacy,
}

/// Volume for one channel. An inactive condition contributes 100 %.
/// Attenuation values above 100 are treated as 100. The result is clamped
/// to a byte.
pub fn effective_volume(
    cfg: &ChannelConfig,
    rain_active: bool,
    ground_active: bool,
    rounding: VolumeRounding,
) -> u8 {
    let rain = if rain_active { cfg.rain_attenuation.min(100) } else { 100 };
    let ground = if ground_active { cfg.ground_attenuation.min(100) } else { 100 };
    let target = u32::from(cfg.target_volume);
    let (rain, ground) = (u32::from(rain), u32::from(ground));

    let volume = match rounding {
        VolumeRounding::Exact => target * rain * ground / 10_000,
        VolumeRounding::Legacy => target * (rain / 100) * (ground / 100),
    };
    volume.min(255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(target: u8, rain: u8, ground: u8) -> ChannelConfig {
        ChannelConfig {
            target_volume: target,
            rain_attenuation: rain,
            ground_attenuation: ground,
        }
    }

    #[test]
    fn inactive_conditions_leave_target_untouched() {
        for target in [0, 1, 99, 200, 255] {
            let c = cfg(target, 10, 20);
            assert_eq!(effective_volume(&c, false, false, VolumeRounding::Exact), target);
            assert_eq!(effective_volume(&c, false, false, VolumeRounding::Legacy), target);
        }
    }

    #[test]
    fn rain_at_fifty_percent_halves_volume() {
        // rain 210 is active, ground 50 is not.
        let c = cfg(200, 50, 100);
        assert_eq!(effective_volume(&c, true, false, VolumeRounding::Exact), 100);
    }

    #[test]
    fn both_factors_multiply() {
        let c = cfg(200, 50, 50);
        assert_eq!(effective_volume(&c, true, true, VolumeRounding::Exact), 50);
        let c = cfg(255, 33, 100);
        assert_eq!(effective_volume(&c, true, true, VolumeRounding::Exact), 84);
    }

    #[test]
    fn legacy_rounding_zeroes_partial_factors() {
        let c = cfg(200, 50, 100);
        assert_eq!(effective_volume(&c, true, false, VolumeRounding::Legacy), 0);
        assert_eq!(effective_volume(&c, false, true, VolumeRounding::Legacy), 200);
    }

    #[test]
    fn oversized_attenuation_is_clamped() {
        let c = cfg(200, 250, 180);
        assert_eq!(effective_volume(&c, true, true, VolumeRounding::Exact), 200);
    }

    #[test]
    fn monotone_in_each_factor() {
        for rounding in [VolumeRounding::Exact, VolumeRounding::Legacy] {
            for target in (0..=255u16).step_by(17) {
                let mut prev = 0;
                for rain in 0..=100u8 {
                    let v = effective_volume(&cfg(target as u8, rain, 70), true, true, rounding);
                    assert!(v >= prev, "target={target} rain={rain} {rounding:?}");
                    prev = v;
                }
                let mut prev = 0;
                for ground in 0..=100u8 {
                    let v = effective_volume(&cfg(target as u8, 40, ground), true, true, rounding);
                    assert!(v >= prev, "target={target} ground={ground} {rounding:?}");
                    prev = v;
                }
            }
        }
    }
}
