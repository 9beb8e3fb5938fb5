//! VCS webhook verification and push-event parsing.
//!
//! Each supported provider authenticates deliveries differently:
//! - GitHub: `X-Hub-Signature-256` = `sha256=` + HMAC-SHA256 over the body
//! - Bitbucket: `X-Hub-Signature`, same scheme as GitHub
//! - GitLab: `X-Gitlab-Token` carries the shared secret verbatim
//!
//! Verification always runs over the raw body bytes exactly as received;
//! callers must not re-serialize parsed JSON before hashing. All comparisons
//! are constant-time and an unknown provider never verifies.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header each provider uses to authenticate a delivery.
pub fn signature_header(provider: &str) -> Option<&'static str> {
    match provider {
        "github" => Some("X-Hub-Signature-256"),
        "bitbucket" => Some("X-Hub-Signature"),
        "gitlab" => Some("X-Gitlab-Token"),
        _ => None,
    }
}

/// Verify a webhook delivery for the named provider.
///
/// `header_value` is the value of the provider's signature header (see
/// [`signature_header`]); absence fails verification. Unknown providers
/// always fail.
pub fn verify(provider: &str, secret: &str, header_value: Option<&str>, body: &[u8]) -> bool {
    match provider {
        "github" | "bitbucket" => verify_hmac(secret, header_value, body),
        "gitlab" => verify_shared_token(secret, header_value),
        _ => false,
    }
}

fn verify_hmac(secret: &str, header_value: Option<&str>, body: &[u8]) -> bool {
    let Some(presented) = header_value else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    let expected = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    constant_time_str_eq(presented, &expected)
}

fn verify_shared_token(secret: &str, header_value: Option<&str>) -> bool {
    match header_value {
        Some(token) if !token.is_empty() => constant_time_str_eq(token, secret),
        _ => false,
    }
}

/// Constant-time string equality; differing lengths compare unequal without
/// short-circuiting on content.
fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// A provider-agnostic view of a push delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Clone/HTTP URL of the repository, falling back to the web URL.
    pub repository_url: String,
    /// `owner/name` form of the repository.
    pub repository_full_name: String,
    /// Full git ref, e.g. `refs/tags/v1.2.3`.
    pub ref_name: String,
    /// Tag name when the ref is a tag ref, otherwise none.
    pub tag: Option<String>,
}

impl PushEvent {
    fn from_ref(repository_url: String, repository_full_name: String, ref_name: String) -> Self {
        let tag = ref_name
            .strip_prefix("refs/tags/")
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Self {
            repository_url,
            repository_full_name,
            ref_name,
            tag,
        }
    }
}

/// Parse a provider push payload into the common shape.
///
/// Returns none for unknown providers, undecodable payloads, and Bitbucket
/// deletions (`changes[0].new == null`).
pub fn parse_push(provider: &str, body: &[u8]) -> Option<PushEvent> {
    match provider {
        "github" => parse_github(body),
        "gitlab" => parse_gitlab(body),
        "bitbucket" => parse_bitbucket(body),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
struct GithubPush {
    #[serde(rename = "ref", default)]
    ref_name: String,
    #[serde(default)]
    repository: GithubRepository,
}

#[derive(Debug, Default, Deserialize)]
struct GithubRepository {
    #[serde(default)]
    clone_url: String,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    full_name: String,
}

fn parse_github(body: &[u8]) -> Option<PushEvent> {
    let payload: GithubPush = serde_json::from_slice(body).ok()?;
    let url = if payload.repository.clone_url.is_empty() {
        payload.repository.html_url
    } else {
        payload.repository.clone_url
    };
    Some(PushEvent::from_ref(
        url,
        payload.repository.full_name,
        payload.ref_name,
    ))
}

#[derive(Debug, Default, Deserialize)]
struct GitlabPush {
    #[serde(rename = "ref", default)]
    ref_name: String,
    #[serde(default)]
    project: GitlabProject,
}

#[derive(Debug, Default, Deserialize)]
struct GitlabProject {
    #[serde(default)]
    git_http_url: String,
    #[serde(default)]
    http_url: String,
    #[serde(default)]
    web_url: String,
    #[serde(default)]
    path_with_namespace: String,
}

fn parse_gitlab(body: &[u8]) -> Option<PushEvent> {
    let payload: GitlabPush = serde_json::from_slice(body).ok()?;
    let project = payload.project;
    let url = [project.git_http_url, project.http_url, project.web_url]
        .into_iter()
        .find(|u| !u.is_empty())
        .unwrap_or_default();
    Some(PushEvent::from_ref(
        url,
        project.path_with_namespace,
        payload.ref_name,
    ))
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketPush {
    #[serde(default)]
    push: BitbucketChanges,
    #[serde(default)]
    repository: BitbucketRepository,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketChanges {
    #[serde(default)]
    changes: Vec<BitbucketChange>,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketChange {
    #[serde(default)]
    new: Option<BitbucketRef>,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketRef {
    #[serde(rename = "type", default)]
    ref_type: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketRepository {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    links: BitbucketLinks,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketLinks {
    #[serde(default)]
    clone: Vec<BitbucketCloneLink>,
    #[serde(default)]
    html: BitbucketHref,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketCloneLink {
    #[serde(default)]
    name: String,
    #[serde(default)]
    href: String,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketHref {
    #[serde(default)]
    href: String,
}

fn parse_bitbucket(body: &[u8]) -> Option<PushEvent> {
    let payload: BitbucketPush = serde_json::from_slice(body).ok()?;
    // Only the first change is considered; a deletion carries no new ref.
    let change = payload.push.changes.into_iter().next()?;
    let new_ref = change.new?;
    let ref_name = match new_ref.ref_type.as_str() {
        "tag" => format!("refs/tags/{}", new_ref.name),
        _ => format!("refs/heads/{}", new_ref.name),
    };
    let url = payload
        .repository
        .links
        .clone
        .into_iter()
        .find(|l| l.name == "https" || l.name == "http")
        .map(|l| l.href)
        .filter(|h| !h.is_empty())
        .unwrap_or(payload.repository.links.html.href);
    Some(PushEvent::from_ref(
        url,
        payload.repository.full_name,
        ref_name,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn github_signature(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_github_verify_accepts_valid_signature() {
        let body = br#"{"ref":"refs/tags/v1.0.0"}"#;
        let sig = github_signature("topsecret", body);
        assert!(verify("github", "topsecret", Some(&sig), body));
    }

    #[test]
    fn test_github_verify_rejects_bad_signature() {
        let body = br#"{"ref":"refs/tags/v1.0.0"}"#;
        assert!(!verify("github", "topsecret", Some("sha256=deadbeef"), body));
        assert!(!verify("github", "topsecret", None, body));
    }

    #[test]
    fn test_bitbucket_uses_same_scheme() {
        let body = br#"{"push":{}}"#;
        let sig = github_signature("s3cret", body);
        assert!(verify("bitbucket", "s3cret", Some(&sig), body));
    }

    #[test]
    fn test_gitlab_shared_token() {
        assert!(verify("gitlab", "tok", Some("tok"), b""));
        assert!(!verify("gitlab", "tok", Some("other"), b""));
        assert!(!verify("gitlab", "tok", Some(""), b""));
        assert!(!verify("gitlab", "tok", None, b""));
        // Unequal length must fail, not panic.
        assert!(!verify("gitlab", "tok", Some("tok-but-longer"), b""));
    }

    #[test]
    fn test_unknown_provider_never_verifies() {
        assert!(!verify("gitea", "s", Some("s"), b"{}"));
    }

    #[test]
    fn test_parse_github_tag_push() {
        let body = br#"{
            "ref": "refs/tags/v1.2.3",
            "repository": {
                "clone_url": "https://github.com/infra/vpc.git",
                "html_url": "https://github.com/infra/vpc",
                "full_name": "infra/vpc"
            }
        }"#;
        let event = parse_push("github", body).unwrap();
        assert_eq!(event.repository_url, "https://github.com/infra/vpc.git");
        assert_eq!(event.repository_full_name, "infra/vpc");
        assert_eq!(event.ref_name, "refs/tags/v1.2.3");
        assert_eq!(event.tag.as_deref(), Some("v1.2.3"));
    }

    #[test]
    fn test_parse_github_branch_push_has_no_tag() {
        let body = br#"{"ref": "refs/heads/main", "repository": {"full_name": "infra/vpc"}}"#;
        let event = parse_push("github", body).unwrap();
        assert_eq!(event.tag, None);
        // Missing URL fields default to empty.
        assert_eq!(event.repository_url, "");
    }

    #[test]
    fn test_parse_gitlab_prefers_clone_url() {
        let body = br#"{
            "ref": "refs/tags/2.0.0",
            "project": {
                "git_http_url": "https://gitlab.com/infra/net.git",
                "web_url": "https://gitlab.com/infra/net",
                "path_with_namespace": "infra/net"
            }
        }"#;
        let event = parse_push("gitlab", body).unwrap();
        assert_eq!(event.repository_url, "https://gitlab.com/infra/net.git");
        assert_eq!(event.tag.as_deref(), Some("2.0.0"));
    }

    #[test]
    fn test_parse_bitbucket_tag() {
        let body = br#"{
            "push": {"changes": [{"new": {"type": "tag", "name": "v0.3.1"}}]},
            "repository": {
                "full_name": "infra/dns",
                "links": {
                    "clone": [
                        {"name": "ssh", "href": "git@bitbucket.org:infra/dns.git"},
                        {"name": "https", "href": "https://bitbucket.org/infra/dns.git"}
                    ],
                    "html": {"href": "https://bitbucket.org/infra/dns"}
                }
            }
        }"#;
        let event = parse_push("bitbucket", body).unwrap();
        assert_eq!(event.repository_url, "https://bitbucket.org/infra/dns.git");
        assert_eq!(event.ref_name, "refs/tags/v0.3.1");
        assert_eq!(event.tag.as_deref(), Some("v0.3.1"));
    }

    #[test]
    fn test_parse_bitbucket_deletion_yields_none() {
        let body = br#"{"push": {"changes": [{"new": null}]}, "repository": {"full_name": "x/y"}}"#;
        assert_eq!(parse_push("bitbucket", body), None);
    }

    #[test]
    fn test_parse_bitbucket_empty_changes_yields_none() {
        let body = br#"{"push": {"changes": []}, "repository": {"full_name": "x/y"}}"#;
        assert_eq!(parse_push("bitbucket", body), None);
    }

    proptest! {
        /// Flipping any byte of the body invalidates a GitHub signature.
        #[test]
        fn prop_github_body_tamper_fails(body in proptest::collection::vec(any::<u8>(), 1..256), index in 0usize..256, bit in 0u8..8) {
            let sig = github_signature("secret", &body);
            let mut tampered = body.clone();
            let i = index % tampered.len();
            tampered[i] ^= 1 << bit;
            prop_assert!(!verify("github", "secret", Some(&sig), &tampered));
        }

        /// Verification never accepts a signature minted with another secret.
        #[test]
        fn prop_wrong_secret_fails(secret_a in "[a-z]{4,16}", secret_b in "[a-z]{4,16}", body in proptest::collection::vec(any::<u8>(), 0..128)) {
            prop_assume!(secret_a != secret_b);
            let sig = github_signature(&secret_a, &body);
            prop_assert!(!verify("github", &secret_b, Some(&sig), &body));
        }
    }
}
