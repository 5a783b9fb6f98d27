//! Small helpers shared across modules.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch (0 if the clock is before 1970).
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Strip the separators people type into phone numbers.
///
/// - `"+90 555 111-22-33"` → `"+905551112233"`
/// - `"(212) 555"` → `"212555"`
/// - Already-clean numbers pass through unchanged.
pub fn strip_phone_separators(number: &str) -> Cow<'_, str> {
    if number.contains([' ', '-', '(', ')']) {
        Cow::Owned(
            number
                .chars()
                .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
                .collect(),
        )
    } else {
        Cow::Borrowed(number)
    }
}

/// A destination is valid when, after stripping separators, it is `+`
/// followed only by digits and is at least 11 characters long.
pub fn is_valid_phone_number(number: &str) -> bool {
    let cleaned = strip_phone_separators(number);
    match cleaned.strip_prefix('+') {
        Some(digits) => cleaned.len() >= 11 && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_common_separators() {
        assert_eq!(strip_phone_separators("+90 555 111-22-33"), "+905551112233");
        assert_eq!(strip_phone_separators("+1 (415) 555-0100"), "+14155550100");
        assert!(matches!(
            strip_phone_separators("+905551112233"),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn test_phone_number_validation() {
        assert!(is_valid_phone_number("+905551112233"));
        assert!(is_valid_phone_number("+90 (555) 111-22-33"));
        assert!(!is_valid_phone_number("905551112233"));
        assert!(!is_valid_phone_number("+90555"));
        assert!(!is_valid_phone_number("+90555abc2233"));
        assert!(!is_valid_phone_number(""));
    }
}
