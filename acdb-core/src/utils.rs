//! # Common Utilities
//!
//! Small helpers shared by the storage layer and tooling.

/// Format bytes in human readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exp = (bytes_f64.log2() / 10.0).floor() as usize;
    let unit_index = exp.min(UNITS.len() - 1);
    let size = bytes_f64 / (1024_f64).powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else if size >= 100.0 {
        format!("{:.0} {}", size, UNITS[unit_index])
    } else if size >= 10.0 {
        format!("{:.1} {}", size, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Align value to boundary
pub fn align_to(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

/// Round a byte length up to a whole number of 32-bit words
pub fn word_align(len: usize) -> usize {
    align_to(len as u64, 4) as usize
}

/// Render a 4-byte chunk or tag id as text when printable
pub fn fourcc(id: [u8; 4]) -> String {
    if id.iter().all(|b| b.is_ascii_graphic()) {
        id.iter().map(|&b| b as char).collect()
    } else {
        format!("{:#010x}", u32::from_le_bytes(id))
    }
}
