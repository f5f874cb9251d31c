//! Checksum utilities for BlobIO
//!
//! Two CRC32C checksums travel with every extent request:
//!
//! - the **content** checksum covers the payload bytes and is verified by
//!   whichever side receives the data;
//! - the **header** checksum covers only `(length, offset)` and lets the
//!   storage node catch a request whose addressing was mangled in flight.

/// CRC32C over a payload
#[inline]
#[must_use]
pub fn content_checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Check a payload against an expected content checksum.
///
/// Returns the recomputed value on mismatch.
#[inline]
pub fn verify_content(data: &[u8], expected: u32) -> std::result::Result<(), u32> {
    let actual = crc32c::crc32c(data);
    if actual == expected {
        Ok(())
    } else {
        Err(actual)
    }
}

/// CRC32C over the little-endian `(length, offset)` pair
#[must_use]
pub fn header_checksum(length: u64, offset: u64) -> u32 {
    let crc = crc32c::crc32c(&length.to_le_bytes());
    crc32c::crc32c_append(crc, &offset.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_content_checksum_verify() {
        let mut data = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut data);
        let crc = content_checksum(&data);

        assert!(verify_content(&data, crc).is_ok());

        data[100] ^= 0xff;
        let err = verify_content(&data, crc).unwrap_err();
        assert_ne!(err, crc);
    }

    #[test]
    fn test_header_checksum_depends_on_both_fields() {
        let base = header_checksum(4096, 8192);
        assert_eq!(base, header_checksum(4096, 8192));
        assert_ne!(base, header_checksum(4096, 0));
        assert_ne!(base, header_checksum(8192, 4096));
    }

    #[test]
    fn test_header_checksum_matches_concatenation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&512u64.to_le_bytes());
        buf.extend_from_slice(&1024u64.to_le_bytes());
        assert_eq!(header_checksum(512, 1024), crc32c::crc32c(&buf));
    }
}
