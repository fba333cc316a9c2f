//! Utility functions for the mesh-proxy-ble crate.

/// Convert Celsius to Fahrenheit.
///
/// # Example
///
/// ```
/// use mesh_proxy_ble::celsius_to_fahrenheit;
///
/// let fahrenheit = celsius_to_fahrenheit(100.0);
/// assert!((fahrenheit - 212.0).abs() < 0.001);
/// ```
#[inline]
pub fn celsius_to_fahrenheit(celsius: f32) -> f32 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Format bytes as space separated upper-case hex, truncated to `limit` bytes.
///
/// Used for frame dumps in trace logs.
pub fn hex_preview(data: &[u8], limit: usize) -> String {
    let mut out = data
        .iter()
        .take(limit)
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > limit {
        out.push_str(" ..");
    }
    out
}
