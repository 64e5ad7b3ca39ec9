/// Send-time trailer carried by every published media sample.
///
/// The last 16 bytes of a sample hold the publisher's send time as lowercase
/// hex nanoseconds on the process-monotonic clock. Hex keeps zero bytes out of
/// the trailer, so it can never form an H.264 start code. Subscribers subtract
/// it from their own clock reading to get one-way latency.

use std::sync::OnceLock;
use std::time::Instant;

use thiserror::Error;

pub const TIMESTAMP_TRAILER_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("sample of {0} bytes cannot hold the timestamp trailer")]
    TooShort(usize),
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds elapsed since the process-wide monotonic epoch.
pub fn monotonic_ns() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// Write `ns` into the trailing bytes of `buf`.
pub fn stamp(buf: &mut [u8], ns: u64) -> Result<(), PayloadError> {
    let len = buf.len();
    if len < TIMESTAMP_TRAILER_LEN {
        return Err(PayloadError::TooShort(len));
    }
    let hex = format!("{ns:016x}");
    buf[len - TIMESTAMP_TRAILER_LEN..].copy_from_slice(hex.as_bytes());
    Ok(())
}

/// Read the send time from the trailer of a sample.
pub fn read_timestamp(sample: &[u8]) -> Option<u64> {
    let start = sample.len().checked_sub(TIMESTAMP_TRAILER_LEN)?;
    let tail = &sample[start..];
    if !tail.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u64::from_str_radix(std::str::from_utf8(tail).ok()?, 16).ok()
}
