//! Resident memory of the current process.

/// Resident set size in bytes, from the `VmRSS` line of `/proc/self/status`.
///
/// `None` where procfs is unavailable.
pub fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

/// `VmRSS:     1234 kB` -> bytes.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find_map(|line| line.strip_prefix("VmRSS:"))?;
    let mut fields = line.split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    let scale = match fields.next() {
        Some("kB") | None => 1024,
        Some("mB") => 1024 * 1024,
        Some("gB") => 1024 * 1024 * 1024,
        Some(_) => return None,
    };
    value.checked_mul(scale)
}
