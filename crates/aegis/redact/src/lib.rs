//! PII redaction for strings and nested JSON values.
//!
//! Pure and deterministic. Masks PANs, phone numbers, and email local
//! parts, and offers a customer-id mask for identifiers that must stay
//! correlatable. Redaction is idempotent: placeholders never re-match, so
//! `redact(redact(x)) = redact(x)`. Clean input is returned borrowed.

#![deny(unsafe_code)]

use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Placeholder substituted for a primary account number.
pub const PAN_PLACEHOLDER: &str = "[PAN REDACTED]";

/// Placeholder substituted for a phone number.
pub const PHONE_PLACEHOLDER: &str = "[PHONE REDACTED]";

/// Mask used when a customer id is too short to partially reveal.
pub const SHORT_ID_MASK: &str = "***masked***";

// 3-3-4 phone layout with optional country prefix and common separators.
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?\d{1,2}[\s.\-]?)?\(?\d{3}\)?[\s.\-]?\d{3}[\s.\-]?\d{4}")
        .unwrap_or_else(|e| panic!("phone pattern: {e}"))
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9._%+\-]+)@([A-Za-z0-9.\-]+\.[A-Za-z]{2,})")
        .unwrap_or_else(|e| panic!("email pattern: {e}"))
});

/// Redact one string. Returns `Cow::Borrowed` when nothing matched.
pub fn redact_str(input: &str) -> Cow<'_, str> {
    // Fast path: nothing to mask without digits or an address sign.
    if !input.bytes().any(|b| b.is_ascii_digit() || b == b'@') {
        return Cow::Borrowed(input);
    }

    let pan = mask_pan_runs(input);
    let phone = PHONE_RE.replace_all(pan.as_ref(), PHONE_PLACEHOLDER);
    let email = mask_emails(phone.as_ref());

    if matches!(
        (&pan, &phone, &email),
        (Cow::Borrowed(_), Cow::Borrowed(_), Cow::Borrowed(_))
    ) {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(email.into_owned())
    }
}

/// Redact every string leaf of a JSON value in place.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Cow::Owned(cleaned) = redact_str(s) {
                *s = cleaned;
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                redact_value(item);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Mask a customer id: first 4 chars + `***` + last 2. Ids shorter than
/// 8 chars give away too much proportionally and are fully masked.
pub fn mask_customer_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() < 8 {
        return SHORT_ID_MASK.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}***{tail}")
}

// A contiguous digit run of 13..=19 is treated as a PAN. Runs are scanned
// manually so non-matching input costs no allocation.
fn mask_pan_runs(input: &str) -> Cow<'_, str> {
    let bytes = input.as_bytes();
    let mut out: Option<String> = None;
    let mut copied = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if (13..=19).contains(&(i - start)) {
                let buf = out.get_or_insert_with(|| String::with_capacity(input.len()));
                buf.push_str(&input[copied..start]);
                buf.push_str(PAN_PLACEHOLDER);
                copied = i;
            }
        } else {
            i += 1;
        }
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&input[copied..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(input),
    }
}

// Keep the first two characters of the local part, preserve the domain.
fn mask_emails(input: &str) -> Cow<'_, str> {
    EMAIL_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        let local = &caps[1];
        let kept: String = local.chars().take(2).collect();
        format!("{kept}***@{}", &caps[2])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn masks_pan_of_each_length() {
        for len in 13..=19 {
            let pan: String = "4".repeat(len);
            let input = format!("card {pan} flagged");
            let cleaned = redact_str(&input);
            assert_eq!(cleaned, format!("card {PAN_PLACEHOLDER} flagged"));
        }
    }

    #[test]
    fn short_digit_runs_pass_through() {
        let input = "order 123456789";
        assert!(matches!(redact_str(input), Cow::Borrowed(_)));
    }

    #[test]
    fn twelve_digit_run_is_treated_as_prefixed_phone() {
        let cleaned = redact_str("ref 123456789012 end");
        assert_eq!(cleaned, format!("ref {PHONE_PLACEHOLDER} end"));
    }

    #[test]
    fn masks_phone_layouts() {
        for input in [
            "call 555-123-4567 now",
            "call (555) 123-4567 now",
            "call +1 555 123 4567 now",
            "call 5551234567 now",
        ] {
            let cleaned = redact_str(input);
            assert!(
                cleaned.contains(PHONE_PLACEHOLDER),
                "not masked: {input} -> {cleaned}"
            );
            assert!(!cleaned.contains("4567"));
        }
    }

    #[test]
    fn masks_email_local_part() {
        let cleaned = redact_str("reach john.doe@example.com today");
        assert_eq!(cleaned, "reach jo***@example.com today");
    }

    #[test]
    fn clean_input_is_borrowed() {
        let input = "no sensitive content here";
        assert!(matches!(redact_str(input), Cow::Borrowed(_)));
    }

    #[test]
    fn customer_id_masking() {
        assert_eq!(mask_customer_id("cust-12345678"), "cust***78");
        assert_eq!(mask_customer_id("short"), SHORT_ID_MASK);
        assert_eq!(mask_customer_id(""), SHORT_ID_MASK);
    }

    #[test]
    fn redacts_nested_values() {
        let mut value = serde_json::json!({
            "note": "pan 4111111111111111 seen",
            "contacts": ["sam.smith@bank.example", {"phone": "555-123-4567"}],
            "amount": 1200,
        });
        redact_value(&mut value);
        assert_eq!(value["note"], format!("pan {PAN_PLACEHOLDER} seen"));
        assert_eq!(value["contacts"][0], "sa***@bank.example");
        assert_eq!(value["contacts"][1]["phone"], PHONE_PLACEHOLDER);
        assert_eq!(value["amount"], 1200);
    }

    #[test]
    fn redaction_is_idempotent_on_known_shapes() {
        for input in [
            "pan 4111111111111111",
            "phone 555-123-4567",
            "mail john.doe@example.com",
            "mix 4111111111111111 555-123-4567 a.b@c.io",
        ] {
            let once = redact_str(input).into_owned();
            let twice = redact_str(&once).into_owned();
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    proptest! {
        #[test]
        fn redact_is_idempotent(input in ".{0,120}") {
            let once = redact_str(&input).into_owned();
            let twice = redact_str(&once).into_owned();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn redacted_output_contains_no_pan_run(input in "[0-9 \\-]{0,64}") {
            let cleaned = redact_str(&input).into_owned();
            let mut run = 0usize;
            let mut longest = 0usize;
            for b in cleaned.bytes() {
                if b.is_ascii_digit() {
                    run += 1;
                    longest = longest.max(run);
                } else {
                    run = 0;
                }
            }
            prop_assert!(!(13..=19).contains(&longest), "pan-length run in {cleaned}");
        }
    }
}
