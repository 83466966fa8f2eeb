const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB", "PB"];

/// Converts the number of bytes to a human-readable string in SI units.
pub fn bytes(n: usize) -> String {
    let mut size = n as f64;
    let mut unit = 0;
    while size >= 1000_f64 && unit < UNITS.len() - 1 {
        size /= 1000_f64;
        unit += 1;
    }
    if unit == 0 {
        return format!("{} {}", n, UNITS[0]);
    }

    // trims "1.50" into "1.5", "2.00" into "2"
    let s = format!("{:.2}", size);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", s, UNITS[unit])
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- humanize::test_bytes --exact --show-output
#[test]
fn test_bytes() {
    assert_eq!(bytes(0), "0 B");
    assert_eq!(bytes(999), "999 B");
    assert_eq!(bytes(1000), "1 kB");
    assert_eq!(bytes(1500), "1.5 kB");
    assert_eq!(bytes(100000), "100 kB");
    assert_eq!(bytes(490652508160), "490.65 GB");
}
