//! Text-layer collaborators: the forbidden-reference predicate and the
//! single-pass transform that rewrites embedded asset references to local ones.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use tracing::debug;

use crate::download::AssetResolver;
use crate::error::AssetError;
use crate::failure_log::FailureLog;
use crate::retry::PassOutput;

/// Inert stand-in for an asset that cannot be made local.
pub const PLACEHOLDER_REFERENCE: &str = "#asset-unavailable";

/// Query parameters that mark a time-limited, signed download link.
pub const DEFAULT_FORBIDDEN_PATTERNS: &[&str] = &[
    r"(?i)[?&]X-Amz-(Signature|Credential|Expires|Security-Token)=",
    r"(?i)[?&]X-Goog-(Signature|Expires)=",
    r"[?&](Expires|Signature|Key-Pair-Id|Policy)=",
    r"[?&]se=\d{4}-\d{2}-\d{2}.*[?&]sig=",
];

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'()\[\]{}|\\^`]+"#).expect("valid url regex"));

static MARKDOWN_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"!\[[^\]]*\]\(\s*<?([^)\s>]+)>?(?:\s+"[^"]*")?\s*\)"#).expect("valid image regex")
});

static HTML_IMG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).expect("valid img regex")
});

/// Strips punctuation that ends a sentence rather than the URL.
fn trim_url(raw: &str) -> &str {
    raw.trim_end_matches(['.', ',', ';', ':', '!', '?'])
}

#[derive(Debug, Clone)]
pub struct ForbiddenPredicate {
    patterns: Vec<Regex>,
}

impl ForbiddenPredicate {
    /// Compiles `patterns`, or the built-in signed-URL patterns when empty.
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = if patterns.is_empty() {
            DEFAULT_FORBIDDEN_PATTERNS
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(Self { patterns })
    }

    pub fn is_forbidden(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(url))
    }

    /// Distinct forbidden URLs in order of first appearance.
    pub fn forbidden_refs(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        URL_RE
            .find_iter(text)
            .map(|m| trim_url(m.as_str()))
            .filter(|url| self.is_forbidden(url) && seen.insert(url.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// `true` when no forbidden reference remains in `text`.
    pub fn holds(&self, text: &str) -> bool {
        URL_RE
            .find_iter(text)
            .all(|m| !self.is_forbidden(trim_url(m.as_str())))
    }
}

/// Rewrites whole URL matches found in `text` using `replacements`.
fn replace_urls(text: &str, replacements: &BTreeMap<String, String>) -> String {
    URL_RE
        .replace_all(text, |caps: &Captures<'_>| {
            let raw = &caps[0];
            let url = trim_url(raw);
            match replacements.get(url) {
                Some(local) => format!("{local}{}", &raw[url.len()..]),
                None => raw.to_string(),
            }
        })
        .into_owned()
}

/// URLs the pass should try to make local: every embedded image plus any
/// forbidden link.
pub fn asset_candidates(text: &str, predicate: &ForbiddenPredicate) -> Vec<String> {
    let images: HashSet<&str> = MARKDOWN_IMAGE_RE
        .captures_iter(text)
        .chain(HTML_IMG_RE.captures_iter(text))
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    let mut seen = HashSet::new();
    URL_RE
        .find_iter(text)
        .map(|m| trim_url(m.as_str()))
        .filter(|url| images.contains(url) || predicate.is_forbidden(url))
        .filter(|url| seen.insert(url.to_string()))
        .map(str::to_string)
        .collect()
}

/// Output with every still-remote asset swapped for the placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubbedText {
    pub text: String,
    /// Distinct forbidden references replaced.
    pub forbidden: usize,
    /// Distinct ordinary images that never became local.
    pub unresolved: usize,
}

impl ScrubbedText {
    pub fn is_clean(&self) -> bool {
        self.forbidden == 0 && self.unresolved == 0
    }
}

/// Replaces every asset candidate left in `text` with [`PLACEHOLDER_REFERENCE`].
/// URLs under `local_prefix` are already local and stay as they are.
pub fn scrub_unresolved(text: &str, predicate: &ForbiddenPredicate, local_prefix: &str) -> ScrubbedText {
    let mut forbidden = 0;
    let mut unresolved = 0;
    let replacements: BTreeMap<String, String> = asset_candidates(text, predicate)
        .into_iter()
        .filter(|url| local_prefix.is_empty() || !url.starts_with(local_prefix))
        .inspect(|url| {
            if predicate.is_forbidden(url) {
                forbidden += 1;
            } else {
                unresolved += 1;
            }
        })
        .map(|url| (url, PLACEHOLDER_REFERENCE.to_string()))
        .collect();

    let text = if replacements.is_empty() {
        text.to_string()
    } else {
        replace_urls(text, &replacements)
    };
    ScrubbedText {
        text,
        forbidden,
        unresolved,
    }
}

/// Everything one resolving pass needs.
#[derive(Clone)]
pub struct ResolvingTransform {
    pub resolver: Arc<AssetResolver>,
    pub predicate: Arc<ForbiddenPredicate>,
    pub failure_log: Option<Arc<FailureLog>>,
}

impl ResolvingTransform {
    /// One pass: resolve every candidate in order, swap in local references.
    ///
    /// Validation failures are replaced by the placeholder straight away.
    /// Download failures keep the original URL so a later pass can retry it.
    pub async fn run_pass(&self, item_id: &str, text: String) -> PassOutput {
        let candidates = asset_candidates(&text, &self.predicate);
        let mut replacements = BTreeMap::new();
        let mut resolved = 0usize;
        let mut failed = 0usize;
        let mut bytes_saved = 0u64;

        for reference in candidates {
            match self.resolver.resolve(&reference).await {
                Ok(asset) => {
                    resolved += 1;
                    bytes_saved += asset.bytes_saved;
                    replacements.insert(reference, asset.local_reference);
                }
                Err(error) => {
                    failed += 1;
                    if let Some(log) = &self.failure_log {
                        log.record_asset(item_id, &error);
                    }
                    debug!(item_id, reference = %reference, kind = error.kind(), "[ASSET] Reference not resolved");
                    if matches!(error, AssetError::Validation { .. }) {
                        replacements.insert(reference, PLACEHOLDER_REFERENCE.to_string());
                    }
                }
            }
        }

        let text = if replacements.is_empty() {
            text
        } else {
            replace_urls(&text, &replacements)
        };
        PassOutput {
            remaining_forbidden: self.predicate.forbidden_refs(&text).len(),
            text,
            resolved,
            failed,
            bytes_saved,
        }
    }

    /// Final step after the last pass: no remote asset survives into output.
    pub fn scrub_unresolved(&self, text: &str) -> ScrubbedText {
        scrub_unresolved(text, &self.predicate, &self.resolver.settings().url_prefix)
    }
}
