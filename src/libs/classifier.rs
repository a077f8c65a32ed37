//! Failure Classifier & Sanitizer
//!
//! Maps `(reason, message)` pairs reported by a back-end onto the portable
//! [`FailureType`] taxonomy via keyword matching, and produces a user-safe
//! message alongside the raw text. Grounded on the teacher's `ErrorOutKinds`
//! (`scaler.rs`) as "a small, hashable, reason-carrying enum classified from
//! a handful of string signals" — generalized here from a single OOM case
//! to a five-way taxonomy and made a pure function instead of a
//! side-effecting detector.

use chrono::{DateTime, Utc};

use crate::models::{FailureRecord, FailureType};

/// One keyword class: the tokens that, if found in the lowercased reason
/// or message, select this [`FailureType`]
struct Keywords {
    failure_type: FailureType,
    tokens: &'static [&'static str],
}

/// Checked in order; reason takes precedence over message, so
/// the caller classifies the reason first and only falls back to the
/// message if the reason matched nothing
const KEYWORDS: &[Keywords] = &[
    Keywords {
        failure_type: FailureType::ImagePull,
        tokens: &["image", "pull", "manifest", "registry"],
    },
    Keywords {
        failure_type: FailureType::ContainerCrash,
        tokens: &["crash", "exit", "oom", "killed"],
    },
    Keywords {
        failure_type: FailureType::ResourceLimit,
        tokens: &["memory", "gpu", "quota", "insufficient", "unavailable"],
    },
    Keywords {
        failure_type: FailureType::Timeout,
        tokens: &["timeout", "deadline"],
    },
];

/// Classify a single lowercased string against the keyword table, if any
/// class matches
fn classify_text(text: &str) -> Option<FailureType> {
    KEYWORDS
        .iter()
        .find(|class| class.tokens.iter().any(|token| text.contains(token)))
        .map(|class| class.failure_type)
}

/// Classify a `(reason, message)` pair into the portable failure taxonomy
///
/// Pure: the same input always yields the same output. Reason is checked before message; if neither matches a
/// known keyword set the result is [`FailureType::Unknown`].
#[must_use]
pub fn classify(reason: &str, message: &str) -> FailureType {
    let reason_lower = reason.to_ascii_lowercase();
    let message_lower = message.to_ascii_lowercase();
    classify_text(&reason_lower)
        .or_else(|| classify_text(&message_lower))
        .unwrap_or(FailureType::Unknown)
}

/// Strip stack traces and internal identifiers from a raw back-end message,
/// returning a short, user-safe description. Never raises.
#[must_use]
pub fn sanitize(failure_type: FailureType, message: &str) -> String {
    // drop anything past the first newline: stack traces and multi-line
    // diagnostic dumps live there, a one-line summary does not
    let first_line = message.lines().next().unwrap_or("").trim();
    // collapse long hex/uuid-looking tokens that are almost always
    // internal identifiers (container ids, image digests) rather than
    // anything a user should see verbatim
    let scrubbed = scrub_identifiers(first_line);
    let suggestion = match failure_type {
        FailureType::ImagePull => "Check that the image reference and registry credentials are correct.",
        FailureType::ContainerCrash => "Check the container's entrypoint and exit code.",
        FailureType::ResourceLimit => "Request a spec with more headroom or reduce concurrent replicas.",
        FailureType::Timeout => "The workload did not become ready in time; check startup latency.",
        FailureType::Unknown => "Contact support if this persists.",
    };
    if scrubbed.is_empty() {
        format!("{}: {suggestion}", failure_type.as_str())
    } else {
        format!("{}: {scrubbed}. {suggestion}", failure_type.as_str())
    }
}

/// Replace long hex-looking runs (container ids, digests) with a
/// placeholder so internal identifiers never leak into a user-facing message
fn scrub_identifiers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = String::new();
    let flush = |run: &mut String, out: &mut String| {
        if run.len() >= 12 && run.chars().all(|c| c.is_ascii_hexdigit()) {
            out.push_str("<id>");
        } else {
            out.push_str(run);
        }
        run.clear();
    };
    for ch in text.chars() {
        if ch.is_ascii_hexdigit() {
            run.push(ch);
        } else {
            flush(&mut run, &mut out);
            out.push(ch);
        }
    }
    flush(&mut run, &mut out);
    out
}

/// Build a complete [`FailureRecord`] from a raw back-end observation
#[must_use]
pub fn classify_and_sanitize(reason: &str, message: &str, occurred_at: DateTime<Utc>) -> FailureRecord {
    let failure_type = classify(reason, message);
    let sanitized_message = sanitize(failure_type, message);
    FailureRecord {
        failure_type,
        raw_reason: reason.to_string(),
        raw_message: message.to_string(),
        sanitized_message,
        occurred_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_pure() {
        assert_eq!(classify("ImagePullBackOff", "manifest unknown"), classify("ImagePullBackOff", "manifest unknown"));
    }

    #[test]
    fn reason_takes_precedence_over_message() {
        // reason matches ImagePull, message matches Timeout: reason wins
        assert_eq!(classify("ErrImagePull", "operation timed out"), FailureType::ImagePull);
    }

    #[test]
    fn keyword_table_matches_each_class() {
        assert_eq!(classify("", "failed to pull image from registry"), FailureType::ImagePull);
        assert_eq!(classify("", "container exited with code 1"), FailureType::ContainerCrash);
        assert_eq!(classify("", "insufficient gpu quota"), FailureType::ResourceLimit);
        assert_eq!(classify("", "context deadline exceeded"), FailureType::Timeout);
        assert_eq!(classify("", "something unexpected happened"), FailureType::Unknown);
    }

    #[test]
    fn sanitizer_never_panics_on_empty_input() {
        let record = classify_and_sanitize("", "", Utc::now());
        assert_eq!(record.failure_type, FailureType::Unknown);
    }

    #[test]
    fn sanitizer_strips_stack_traces() {
        let msg = "panic: nil pointer\n  at foo.rs:42\n  at bar.rs:7";
        let sanitized = sanitize(FailureType::ContainerCrash, msg);
        assert!(!sanitized.contains("foo.rs"));
    }

    #[test]
    fn sanitizer_scrubs_long_hex_identifiers() {
        let msg = "container 4f3a9bd0c1e2a7b5d6f8c9e0a1b2c3d4 exited";
        let sanitized = sanitize(FailureType::ContainerCrash, msg);
        assert!(!sanitized.contains("4f3a9bd0c1e2a7b5d6f8c9e0a1b2c3d4"));
        assert!(sanitized.contains("<id>"));
    }
}
