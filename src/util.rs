use std::time::Duration;

/// Bytes in a mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Convert a byte count to mebibytes, for human-readable logging.
///
/// # Examples
///
/// ```rust
/// assert_eq!(format!("{:.3}", mib(3 * MIB / 2)), "1.500");
/// ```
#[must_use]
#[expect(clippy::cast_precision_loss)]
pub fn mib(bytes: u64) -> f64 {
    // `f64` not for precision, but to be able to fit as big as possible file
    // sizes.
    bytes as f64 / MIB as f64
}

/// Scale `total` by the ratio `part / whole`, without overflowing.
///
/// Returns zero when `whole` is zero.
#[must_use]
pub fn scale(total: u64, part: u128, whole: u128) -> u64 {
    if whole == 0 {
        return 0;
    }

    let scaled = u128::from(total).saturating_mul(part) / whole;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Scale `duration` by the ratio `part / whole` with millisecond precision.
#[must_use]
pub fn scale_duration(duration: Duration, part: u64, whole: u64) -> Duration {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(scale(millis, part.into(), whole.into()))
}
