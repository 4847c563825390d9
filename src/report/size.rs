//! Human-readable byte sizes

const SUFFIXES: [&str; 9] = ["", "K", "M", "G", "T", "P", "E", "Z", "Y"];

/// Render `bytes` with a 1024-based suffix.
///
/// Exact multiples print as integers (`2K`), everything else with one
/// decimal (`1.5K`). Callers append the unit, e.g. `format!("{}B", ...)`.
pub fn human_size(bytes: u64) -> String {
    let value = u128::from(bytes);
    for (i, suffix) in SUFFIXES.iter().enumerate() {
        let unit = 1024u128.pow(i as u32);
        let last = i == SUFFIXES.len() - 1;
        if value < unit * 1024 || last {
            return if value % unit == 0 {
                format!("{}{}", value / unit, suffix)
            } else {
                format!("{:.1}{}", value as f64 / unit as f64, suffix)
            };
        }
    }
    bytes.to_string()
}
