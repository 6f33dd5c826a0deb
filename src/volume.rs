//! Percent/dB volume scaling with a per-device maximum (C12).

/// Mute, expressed in dB.
pub const MUTE_DB: f32 = -144.0;

/// Lower bound of the audible dB range (0% maps here, exclusive of mute).
const MIN_AUDIBLE_DB: f32 = -30.0;

/// Upper bound of the audible dB range (100% maps here).
const MAX_AUDIBLE_DB: f32 = 0.0;

/// Clamp a configured `max_volume` to the valid `[1, 11]` range, warning on
/// rejection.
#[must_use]
pub fn clamp_max_volume(max_volume: u8) -> u8 {
    if (1..=11).contains(&max_volume) {
        max_volume
    } else {
        tracing::warn!(max_volume, "max_volume out of [1, 11], clamping to 11");
        11
    }
}

/// Convert a volume percent (0..=100) to dB, scaled by `max_volume` (1..=11).
///
/// `0%` is mute (`-144 dB`). `1..=100%` maps onto `[-30, 0]` dB via
/// `dB = -30 + max_volume * pct * 30 / (100 * 11)`.
#[must_use]
pub fn percent_to_db(pct: u8, max_volume: u8) -> f32 {
    if pct == 0 {
        return MUTE_DB;
    }
    let max_volume = clamp_max_volume(max_volume);
    MIN_AUDIBLE_DB + f32::from(max_volume) * f32::from(pct) * 30.0 / (100.0 * 11.0)
}

/// Convert a device-reported dB value back to a volume percent.
///
/// Returns `0` for `db <= MIN_AUDIBLE_DB` or `db` outside the audible
/// range entirely; otherwise inverts [`percent_to_db`].
#[must_use]
pub fn db_to_percent(db: f32, max_volume: u8) -> u8 {
    if db <= MIN_AUDIBLE_DB || db > MAX_AUDIBLE_DB {
        return 0;
    }
    let max_volume = clamp_max_volume(max_volume);
    let pct = (db - MIN_AUDIBLE_DB) * 100.0 * 11.0 / (f32::from(max_volume) * 30.0);
    pct.round().clamp(0.0, 100.0) as u8
}

/// Format a dB value the way the wire protocol requires: locale-independent,
/// sign and fractional part written manually, six decimal digits
/// (`-0.3` becomes `-0.300000`, never `0.3`).
#[must_use]
pub fn format_db(db: f32) -> String {
    let sign = if db.is_sign_negative() { "-" } else { "" };
    let magnitude = db.abs();
    let whole = magnitude.trunc() as i64;
    let frac = ((magnitude.fract()) * 1_000_000.0).round() as i64;
    format!("{sign}{whole}.{frac:06}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_percent_is_mute() {
        assert_eq!(percent_to_db(0, 11), MUTE_DB);
    }

    #[test]
    fn full_percent_at_max_volume_is_zero_db() {
        let db = percent_to_db(100, 11);
        assert!((db - 0.0).abs() < 1e-4, "got {db}");
    }

    #[test]
    fn full_percent_scaled_by_lower_max_volume() {
        let db = percent_to_db(100, 1);
        let expected = -30.0 + 1.0 * 100.0 * 30.0 / (100.0 * 11.0);
        assert!((db - expected).abs() < 1e-4, "got {db}");
    }

    #[test]
    fn max_volume_out_of_range_clamps_to_eleven() {
        assert_eq!(percent_to_db(100, 20), percent_to_db(100, 11));
        assert_eq!(percent_to_db(100, 0), percent_to_db(100, 11));
    }

    #[test]
    fn db_to_percent_inverts_percent_to_db() {
        for pct in [1u8, 11, 50, 99, 100] {
            let db = percent_to_db(pct, 11);
            let round_tripped = db_to_percent(db, 11);
            assert!(
                (i32::from(round_tripped) - i32::from(pct)).abs() <= 1,
                "pct={pct} db={db} round_tripped={round_tripped}"
            );
        }
    }

    #[test]
    fn db_outside_audible_range_is_zero_percent() {
        assert_eq!(db_to_percent(-144.0, 11), 0);
        assert_eq!(db_to_percent(-31.0, 11), 0);
        assert_eq!(db_to_percent(1.0, 11), 0);
    }

    #[test]
    fn format_db_matches_wire_precision() {
        assert_eq!(format_db(-0.3), "-0.300000");
        assert_eq!(format_db(0.0), "0.000000");
        assert_eq!(format_db(-30.0), "-30.000000");
    }
}
