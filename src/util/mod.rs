//! Utility module
//!
//! This module provides common helpers used throughout the library.

use std::fmt::Write;

use tracing::Level;

/// Formats bytes as space separated upper case hex
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", b);
    }
    out
}

/// Installs a formatting subscriber at the given level.
///
/// Returns false when a global subscriber was already installed.
pub fn init_tracing(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Iterates the ids whose bits are set in a node bitmap.
///
/// Bit 0 of byte 0 is node 1.
pub fn bitmap_ids(bitmap: &[u8]) -> impl Iterator<Item = u8> + '_ {
    bitmap.iter().enumerate().flat_map(|(i, byte)| {
        (0..8u8).filter_map(move |bit| {
            if byte & (1 << bit) != 0 {
                u8::try_from(i * 8 + bit as usize + 1).ok()
            } else {
                None
            }
        })
    })
}
