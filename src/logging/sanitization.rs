use regex::Regex;
use std::sync::OnceLock;

/// Regex and replacement pairs, applied in order
struct SanitizationPatterns {
    rules: Vec<(Regex, &'static str)>,
}

static PATTERNS: OnceLock<SanitizationPatterns> = OnceLock::new();

const RULES: &[(&str, &str)] = &[
    // Bearer tokens in Authorization headers
    (r"(?i)\bBearer\s+[A-Za-z0-9\-_.~+/]+=*", "Bearer [REDACTED]"),
    // Bare JWTs (header.payload.signature)
    (
        r"\beyJ[A-Za-z0-9_-]*\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*",
        "[REDACTED_JWT]",
    ),
    // key=value / key: value secrets
    (
        r"(?i)\b(signing_secret|secret|password|passwd|token)\s*[:=]\s*[^\s,;&]+",
        "$1=[REDACTED]",
    ),
    // Credentials embedded in URLs
    (r"(?i)\b(https?://)[^/\s:@]+:[^/\s@]+@", "${1}[REDACTED]@"),
];

fn patterns() -> &'static SanitizationPatterns {
    PATTERNS.get_or_init(|| SanitizationPatterns {
        rules: RULES
            .iter()
            .filter_map(|(pattern, replacement)| {
                Regex::new(pattern).ok().map(|regex| (regex, *replacement))
            })
            .collect(),
    })
}

/// Redact credentials from a message before it is logged
///
/// Admin-service errors can echo request headers or URLs; this strips
/// bearer tokens, bare JWTs, `secret=`/`password=`/`token=` values and URL
/// userinfo.
pub fn sanitize_log_message(message: &str) -> String {
    patterns()
        .rules
        .iter()
        .fold(message.to_string(), |acc, (regex, replacement)| {
            regex.replace_all(&acc, *replacement).into_owned()
        })
}
