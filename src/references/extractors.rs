//! The closed-set reference extractor registry (§4.D). Each entry pattern-
//! matches message text and normalizes matches into a stable, comparable
//! value. Extraction iterates every extractor over the full text — it does
//! not stop at the first match, and duplicate values across extractors are
//! intentional (de-duplication happens only at [`super::ConversationReferences::unique_values`]).

use once_cell::sync::Lazy;
use regex::Regex;

use super::{Reference, ReferenceType};

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("reference extractor pattern must compile")
}

static GITHUB_ISSUE_OR_PR_URL: Lazy<Regex> =
    Lazy::new(|| re(r"https?://github\.com/([\w.-]+/[\w.-]+)/(issues|pull)/(\d+)"));
static GITHUB_BARE_HASH: Lazy<Regex> = Lazy::new(|| re(r"(?:^|[\s(\[])#(\d+)\b"));
static GITHUB_REPO_URL: Lazy<Regex> = Lazy::new(|| re(r"https?://github\.com/([\w.-]+)/([\w.-]+)\b"));
static GITLAB_URL: Lazy<Regex> =
    Lazy::new(|| re(r"https?://gitlab\.com/([\w.-]+(?:/[\w.-]+)*)/-/(?:issues|merge_requests)/(\d+)"));
static TICKET: Lazy<Regex> = Lazy::new(|| re(r"\b([A-Z]{2,}-\d+)\b"));
static CONFLUENCE: Lazy<Regex> =
    Lazy::new(|| re(r"https?://[\w.-]+\.atlassian\.net/wiki/spaces/[\w-]+/pages/(\d+)"));
static NOTION: Lazy<Regex> = Lazy::new(|| re(r"https?://[\w.-]*notion\.so/(?:[\w-]*-)?([0-9a-fA-F]{32})"));
static GDOC: Lazy<Regex> = Lazy::new(|| re(r"https?://docs\.google\.com/document/d/([\w-]+)"));
static GSHEET: Lazy<Regex> = Lazy::new(|| re(r"https?://docs\.google\.com/spreadsheets/d/([\w-]+)"));
static GSLIDE: Lazy<Regex> = Lazy::new(|| re(r"https?://docs\.google\.com/presentation/d/([\w-]+)"));
static FIGMA: Lazy<Regex> = Lazy::new(|| re(r"https?://(?:www\.)?figma\.com/(?:file|design)/([\w-]+)"));
static ASANA: Lazy<Regex> = Lazy::new(|| re(r"https?://app\.asana\.com/\d+/\d+/(\d+)"));
static CLICKUP: Lazy<Regex> = Lazy::new(|| re(r"https?://app\.clickup\.com/t/([\w-]+)"));
static SENTRY: Lazy<Regex> =
    Lazy::new(|| re(r"https?://[\w.-]*sentry\.io/(?:organizations/[\w-]+/)?issues/(\d+)"));
static DATADOG: Lazy<Regex> =
    Lazy::new(|| re(r"https?://app\.datadoghq\.com/(?:monitors|apm/trace)/([\w-]+)"));
static PAGERDUTY: Lazy<Regex> = Lazy::new(|| re(r"https?://[\w.-]+\.pagerduty\.com/incidents/([\w-]+)"));
static AWS_LOG_GROUP: Lazy<Regex> = Lazy::new(|| re(r"(/aws/[\w./-]+)"));
static ZENDESK: Lazy<Regex> = Lazy::new(|| re(r"https?://[\w.-]+\.zendesk\.com/agent/tickets/(\d+)"));
static SALESFORCE: Lazy<Regex> =
    Lazy::new(|| re(r"https?://[\w.-]*(?:lightning\.force\.com|salesforce\.com)/lightning/r/\w+/(\w{15,18})/view"));
static ERROR_PASCAL: Lazy<Regex> = Lazy::new(|| re(r"\b([A-Z][a-zA-Z0-9]*(?:Error|Exception|Fault))\b"));
static ERROR_HTTP_CODE: Lazy<Regex> = Lazy::new(|| re(r"(?i)\b(\d{3})\s+(?:error|status)\b"));
static USER_MENTION: Lazy<Regex> = Lazy::new(|| re(r"<@([A-Za-z0-9]+)(?:\|[^>]*)?>"));
static SERVICE_NAME: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)\b([a-z][a-z0-9]*(?:-[a-z0-9]+)+-(?:service|svc|api|worker))\b"));
static SLACK_MESSAGE_URL: Lazy<Regex> =
    Lazy::new(|| re(r"https?://[\w.-]+\.slack\.com/archives/([A-Z0-9]+)/p(\d{16})"));

/// Run every extractor over `text`, tagging each hit with `message_ts`.
pub fn extract(text: &str, message_ts: &str) -> Vec<Reference> {
    let mut out = Vec::new();

    for caps in GITHUB_ISSUE_OR_PR_URL.captures_iter(text) {
        let kind = &caps[2];
        let num = &caps[3];
        let ty = if kind == "pull" {
            ReferenceType::GithubPr
        } else {
            ReferenceType::GithubIssue
        };
        push(&mut out, ty, format!("#{num}"), &caps[0], message_ts);
    }
    for caps in GITHUB_BARE_HASH.captures_iter(text) {
        push(&mut out, ReferenceType::GithubIssue, format!("#{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in GITHUB_REPO_URL.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        // Skip matches immediately followed by /issues/ or /pull/, which the
        // issue/pull URL pattern above already accounted for.
        let tail = &text[whole.end()..];
        if tail.starts_with("/issues/") || tail.starts_with("/pull/") {
            continue;
        }
        push(
            &mut out,
            ReferenceType::GithubUrl,
            format!("github:{}/{}", &caps[1], &caps[2]),
            whole.as_str(),
            message_ts,
        );
    }
    for caps in GITLAB_URL.captures_iter(text) {
        push(
            &mut out,
            ReferenceType::Gitlab,
            format!("gitlab:{}#{}", &caps[1], &caps[2]),
            &caps[0],
            message_ts,
        );
    }
    for caps in TICKET.captures_iter(text) {
        push(&mut out, ReferenceType::Ticket, caps[1].to_uppercase(), &caps[0], message_ts);
    }
    for caps in CONFLUENCE.captures_iter(text) {
        push(&mut out, ReferenceType::Confluence, format!("confluence:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in NOTION.captures_iter(text) {
        push(&mut out, ReferenceType::Notion, format!("notion:{}", caps[1].to_lowercase()), &caps[0], message_ts);
    }
    for caps in GDOC.captures_iter(text) {
        push(&mut out, ReferenceType::Gdoc, format!("gdoc:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in GSHEET.captures_iter(text) {
        push(&mut out, ReferenceType::Gsheet, format!("gsheet:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in GSLIDE.captures_iter(text) {
        push(&mut out, ReferenceType::Gslide, format!("gslide:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in FIGMA.captures_iter(text) {
        push(&mut out, ReferenceType::Figma, format!("figma:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in ASANA.captures_iter(text) {
        push(&mut out, ReferenceType::Asana, format!("asana:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in CLICKUP.captures_iter(text) {
        push(&mut out, ReferenceType::Clickup, format!("clickup:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in SENTRY.captures_iter(text) {
        push(&mut out, ReferenceType::Sentry, format!("sentry:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in DATADOG.captures_iter(text) {
        push(&mut out, ReferenceType::Datadog, format!("datadog:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in PAGERDUTY.captures_iter(text) {
        push(&mut out, ReferenceType::Pagerduty, format!("pagerduty:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in AWS_LOG_GROUP.captures_iter(text) {
        push(&mut out, ReferenceType::AwsLogGroup, format!("aws_log_group:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in ZENDESK.captures_iter(text) {
        push(&mut out, ReferenceType::Zendesk, format!("zendesk:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in SALESFORCE.captures_iter(text) {
        push(&mut out, ReferenceType::Salesforce, format!("salesforce:{}", &caps[1]), &caps[0], message_ts);
    }
    for caps in ERROR_PASCAL.captures_iter(text) {
        push(&mut out, ReferenceType::ErrorPattern, caps[1].to_lowercase(), &caps[0], message_ts);
    }
    for caps in ERROR_HTTP_CODE.captures_iter(text) {
        push(&mut out, ReferenceType::ErrorPattern, caps[1].to_string(), &caps[0], message_ts);
    }
    for caps in USER_MENTION.captures_iter(text) {
        push(&mut out, ReferenceType::UserMention, caps[1].to_string(), &caps[0], message_ts);
    }
    for caps in SERVICE_NAME.captures_iter(text) {
        push(&mut out, ReferenceType::ServiceName, caps[1].to_lowercase(), &caps[0], message_ts);
    }
    for caps in SLACK_MESSAGE_URL.captures_iter(text) {
        let channel = &caps[1];
        let Some(ts) = super::normalize::url_form_to_ts(&caps[2]) else {
            continue;
        };
        push(&mut out, ReferenceType::SlackMessage, format!("slack:{channel}:{ts}"), &caps[0], message_ts);
    }

    out
}

fn push(out: &mut Vec<Reference>, ref_type: ReferenceType, value: String, raw: &str, message_ts: &str) {
    out.push(Reference {
        ref_type,
        value,
        raw: raw.trim().to_string(),
        message_ts: message_ts.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_hash_requires_boundary() {
        let refs = extract("see (#123) for details", "1.0");
        assert!(refs.iter().any(|r| r.ref_type == ReferenceType::GithubIssue && r.value == "#123"));

        let no_match = extract("foo#123bar", "1.0");
        assert!(!no_match.iter().any(|r| r.ref_type == ReferenceType::GithubIssue));
    }

    #[test]
    fn github_pull_url_normalizes_to_hash_num() {
        let refs = extract("https://github.com/acme/widgets/pull/42 is ready", "1.0");
        assert!(refs.iter().any(|r| r.ref_type == ReferenceType::GithubPr && r.value == "#42"));
    }

    #[test]
    fn ticket_requires_two_leading_capitals() {
        let refs = extract("working on ABC-123 today", "1.0");
        assert!(refs.iter().any(|r| r.ref_type == ReferenceType::Ticket && r.value == "ABC-123"));

        let lowercase = extract("working on abc-123 today", "1.0");
        assert!(!lowercase.iter().any(|r| r.ref_type == ReferenceType::Ticket));
    }

    #[test]
    fn user_mention_strips_display_name() {
        let refs = extract("hey <@U123|alice> can you look", "1.0");
        assert!(refs.iter().any(|r| r.ref_type == ReferenceType::UserMention && r.value == "U123"));
    }

    #[test]
    fn error_pattern_pascal_case_lowercased() {
        let refs = extract("got a NullPointerException in prod", "1.0");
        assert!(refs
            .iter()
            .any(|r| r.ref_type == ReferenceType::ErrorPattern && r.value == "nullpointerexception"));
    }

    #[test]
    fn error_pattern_http_code_requires_trailing_word() {
        let refs = extract("getting 404 error on checkout", "1.0");
        assert!(refs.iter().any(|r| r.ref_type == ReferenceType::ErrorPattern && r.value == "404"));

        let bare_number = extract("there were 404 requests", "1.0");
        assert!(!bare_number.iter().any(|r| r.ref_type == ReferenceType::ErrorPattern));
    }

    #[test]
    fn duplicate_matches_across_extractors_are_kept() {
        let refs = extract("#123 and again #123 in the same message", "1.0");
        assert_eq!(refs.iter().filter(|r| r.value == "#123").count(), 2);
    }

    #[test]
    fn slack_message_url_normalizes_with_split_ts() {
        let refs = extract(
            "see https://acme.slack.com/archives/C0123/p1700000000000100 for context",
            "1.0",
        );
        assert!(refs
            .iter()
            .any(|r| r.ref_type == ReferenceType::SlackMessage && r.value == "slack:C0123:1700000000.000100"));
    }
}
