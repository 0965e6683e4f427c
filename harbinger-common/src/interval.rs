//! Interval parsing and rendering for the admin console.
//!
//! Operators write intervals either as plain seconds (`"300"`) or as a
//! concatenation of day/hour/minute/second components (`"1d2h30m"`). The
//! rendered form uses the same unit letters.

/// Parse an interval expression into seconds. Returns `None` on any
/// malformed input, including an empty string and a trailing number with
/// no unit once a unit has been used.
#[must_use]
pub fn parse_interval(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.bytes().all(|b| b.is_ascii_digit()) {
        return text.parse().ok();
    }

    let mut total: u64 = 0;
    let mut value: Option<u64> = None;
    for b in text.bytes() {
        match b {
            b'0'..=b'9' => {
                let digit = u64::from(b - b'0');
                value = Some(value.unwrap_or(0).checked_mul(10)?.checked_add(digit)?);
            }
            b'd' | b'h' | b'm' | b's' => {
                let factor = match b {
                    b'd' => 86_400,
                    b'h' => 3_600,
                    b'm' => 60,
                    _ => 1,
                };
                total = total.checked_add(value.take()?.checked_mul(factor)?)?;
            }
            _ => return None,
        }
    }
    if value.is_some() {
        // digits without a closing unit
        return None;
    }
    Some(total)
}

/// Render seconds in `NdNhNmNs` form, omitting zero components. Zero
/// renders as `"0s"`.
#[must_use]
pub fn format_interval(mut seconds: u64) -> String {
    if seconds == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, factor) in [('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)] {
        let count = seconds / factor;
        seconds %= factor;
        if count > 0 {
            out.push_str(&format!("{count}{unit}"));
        }
    }
    out
}
