//! Redaction of sensitive content before it reaches an LLM.
//!
//! Rules run in a fixed order over the running result of the previous rule,
//! so a later rule sees placeholders written by an earlier one:
//!
//! | # | Rule | Placeholder |
//! |---|------|-------------|
//! | 1 | email address | `[REDACTED_EMAIL]` |
//! | 2 | phone number | `[REDACTED_PHONE]` |
//! | 3 | national ID (SSN shape) | `[REDACTED_NATIONAL_ID]` |
//! | 4 | payment card | `[REDACTED_CARD]` |
//! | 5 | API key (`sk-`, `ghp_`, `xoxb-`, ...) | `[REDACTED_API_KEY]` |
//! | 6 | bearer token | `Bearer [REDACTED_TOKEN]` |
//! | 7 | cloud key (AWS, Google) | `[REDACTED_CLOUD_KEY]` |
//! | 8 | generic `key=value` secret | `key=[REDACTED_SECRET]` |
//!
//! After redaction the text is cut to `max_length` characters and
//! [`TRUNCATION_MARKER`] is appended.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Appended to text cut at the length ceiling.
pub const TRUNCATION_MARKER: &str = " [...truncated]";

struct RedactionRule {
    name: &'static str,
    regex: &'static LazyLock<Option<Regex>>,
    replacement: &'static str,
}

macro_rules! redaction_pattern {
    ($name:ident, $regex_str:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($regex_str).ok());
    };
}

redaction_pattern!(RE_EMAIL, r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}");

redaction_pattern!(
    RE_PHONE,
    r"(?:\+\d{1,3}[\s.\-]?)?\(?\b\d{3}\)?[\s.\-]\d{3}[\s.\-]\d{4}\b"
);

redaction_pattern!(RE_NATIONAL_ID, r"\b\d{3}-\d{2}-\d{4}\b");

// 16-digit cards in groups of four, or 15-digit Amex (4-6-5).
redaction_pattern!(
    RE_CARD,
    r"\b(?:\d{4}[ \-]?){3}\d{4}\b|\b\d{4}[ \-]?\d{6}[ \-]?\d{5}\b"
);

redaction_pattern!(
    RE_API_KEY,
    r"\b(?:sk|pk|rk)[\-_][A-Za-z0-9_\-]{16,}|\bgh[pousr]_[A-Za-z0-9]{20,}|\bxox[abprs]-[A-Za-z0-9\-]{10,}"
);

// Same-line token of at least 8 chars, so prose like "a bearer token" is kept.
redaction_pattern!(RE_BEARER, r"(?i)\bbearer[ \t]+[A-Za-z0-9\-._~+/]{8,}=*");

redaction_pattern!(
    RE_CLOUD_KEY,
    r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b|\bAIza[0-9A-Za-z\-_]{35}"
);

// Values that already start with a placeholder bracket are left alone.
redaction_pattern!(
    RE_GENERIC_SECRET,
    r#"(?i)\b(password|passwd|pwd|secret|token|api[_\-]?key|access[_\-]?key|private[_\-]?key|client[_\-]?secret)(\s*[:=]\s*)(["']?)[^\s"',;\[][^\s"',;]*"#
);

fn rules() -> [RedactionRule; 8] {
    [
        RedactionRule {
            name: "email",
            regex: &RE_EMAIL,
            replacement: "[REDACTED_EMAIL]",
        },
        RedactionRule {
            name: "phone",
            regex: &RE_PHONE,
            replacement: "[REDACTED_PHONE]",
        },
        RedactionRule {
            name: "national_id",
            regex: &RE_NATIONAL_ID,
            replacement: "[REDACTED_NATIONAL_ID]",
        },
        RedactionRule {
            name: "card",
            regex: &RE_CARD,
            replacement: "[REDACTED_CARD]",
        },
        RedactionRule {
            name: "api_key",
            regex: &RE_API_KEY,
            replacement: "[REDACTED_API_KEY]",
        },
        RedactionRule {
            name: "bearer_token",
            regex: &RE_BEARER,
            replacement: "Bearer [REDACTED_TOKEN]",
        },
        RedactionRule {
            name: "cloud_key",
            regex: &RE_CLOUD_KEY,
            replacement: "[REDACTED_CLOUD_KEY]",
        },
        RedactionRule {
            name: "generic_secret",
            regex: &RE_GENERIC_SECRET,
            replacement: "${1}${2}${3}[REDACTED_SECRET]",
        },
    ]
}

/// Output of [`sanitize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub text: String,
    pub redactions: usize,
    pub truncated: bool,
}

/// Redact sensitive substrings and cap the result at `max_length` characters.
///
/// Never fails. Empty input yields empty output with no redactions.
pub fn sanitize(content: &str, max_length: usize) -> Sanitized {
    let mut text = content.to_string();
    let mut redactions = 0;

    for rule in rules().iter() {
        let Some(re) = &**rule.regex else {
            tracing::warn!(rule = rule.name, "redaction pattern failed to compile; skipped");
            continue;
        };
        let matches = re.find_iter(&text).count();
        if matches == 0 {
            continue;
        }
        redactions += matches;
        if let Cow::Owned(replaced) = re.replace_all(&text, rule.replacement) {
            text = replaced;
        }
    }

    let truncated = text.chars().count() > max_length;
    if truncated {
        let mut cut: String = text.chars().take(max_length).collect();
        cut.push_str(TRUNCATION_MARKER);
        text = cut;
    }

    Sanitized {
        text,
        redactions,
        truncated,
    }
}

/// A configured sanitizer, injected into the context builder.
#[derive(Debug, Clone, Copy)]
pub struct Sanitizer {
    max_length: usize,
}

impl Sanitizer {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn sanitize(&self, content: &str) -> Sanitized {
        sanitize(content, self.max_length)
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(4_000)
    }
}
