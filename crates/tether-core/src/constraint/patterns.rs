//! Shared detection patterns for string value kinds.
//!
//! `url`, `email` and `phone` are strings with a shape. The shape is checked
//! here so the `Type` rule and the kind listing in prompts agree on it.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Email address pattern (RFC 5322 simplified), anchored.
    pub static ref EMAIL_PATTERN: Regex = Regex::new(
        r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$"
    ).unwrap();

    /// Phone number: optional `+`, digits with common separators, 7-15 digits total.
    pub static ref PHONE_PATTERN: Regex = Regex::new(
        r"^\+?[0-9][0-9\s().-]{5,18}[0-9]$"
    ).unwrap();

    /// http(s) URL with a host.
    pub static ref URL_PATTERN: Regex = Regex::new(
        r"^https?://[a-zA-Z0-9.-]+(:[0-9]{1,5})?(/\S*)?$"
    ).unwrap();
}

/// Check if the whole value is an email address.
pub fn is_email(value: &str) -> bool {
    EMAIL_PATTERN.is_match(value)
}

/// Check if the whole value is a phone number.
pub fn is_phone(value: &str) -> bool {
    if !PHONE_PATTERN.is_match(value) {
        return false;
    }
    let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
    (7..=15).contains(&digits)
}

/// Check if the whole value is an http(s) URL.
pub fn is_url(value: &str) -> bool {
    URL_PATTERN.is_match(value)
}
