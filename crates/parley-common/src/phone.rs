//! Phone number normalization
//!
//! Recipients are deduplicated on their digits-only form, and numbers are
//! handed to the gateway with a country code prefix.

/// Strip everything except ASCII digits
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Normalize a phone number to digits with a country code prefix.
///
/// A number is assumed to already carry `country_code` only when it starts
/// with it and is longer than `national_max_len`; otherwise the code is
/// prepended. Returns `None` when the input has no digits at all.
pub fn normalize(raw: &str, country_code: &str, national_max_len: usize) -> Option<String> {
    let digits = digits_only(raw);
    if digits.is_empty() {
        return None;
    }

    if digits.starts_with(country_code) && digits.len() > national_max_len {
        Some(digits)
    } else {
        Some(format!("{}{}", country_code, digits))
    }
}
