//! CRC32C (Castagnoli) used for duplicate fingerprints and for deriving
//! directory and job ids.
//!
//! On x86_64 with SSE4.2 the `crc32` instruction is used; everywhere else a
//! table driven implementation. Both produce identical values.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const POLY: u32 = 0x82F6_3B78;

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
}

static TABLE: [u32; 256] = make_table();

/// Table driven CRC32C continuing from a previously finished value.
pub fn append_software(crc: u32, data: &[u8]) -> u32 {
    let mut state = !crc;
    for &byte in data {
        let idx = ((state ^ byte as u32) & 0xFF) as usize;
        state = (state >> 8) ^ TABLE[idx];
    }
    !state
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
unsafe fn append_sse42(crc: u32, data: &[u8]) -> u32 {
    use std::arch::x86_64::{_mm_crc32_u64, _mm_crc32_u8};

    let mut state = (!crc) as u64;
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        state = _mm_crc32_u64(state, u64::from_le_bytes(word));
    }
    let mut state = state as u32;
    for &byte in chunks.remainder() {
        state = _mm_crc32_u8(state, byte);
    }
    !state
}

/// Whether the hardware path is in use on this machine.
pub fn hardware_accelerated() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("sse4.2")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// CRC32C continuing from `crc` (use 0 to start).
pub fn append(crc: u32, data: &[u8]) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("sse4.2") {
            // SAFETY: the feature was detected at runtime.
            return unsafe { append_sse42(crc, data) };
        }
    }
    append_software(crc, data)
}

pub fn crc32c(data: &[u8]) -> u32 {
    append(0, data)
}

/// CRC32C over the complete contents of a file.
pub fn file_crc32c(path: &Path) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut crc = 0;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        crc = append(crc, &buf[..n]);
    }
    Ok(crc)
}
