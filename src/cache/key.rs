//! Cache key derivation for repository cards.
//!
//! A [`CacheKey`] is the normalized `owner/repo` pair: lowercased, with a
//! trailing `.git` removed, and restricted to the characters GitHub allows in
//! account and repository names so that it is always safe as a path
//! component and a URL segment.

use std::fmt;

use crate::error::CardError;

/// GitHub caps login names at 39 characters and repository names at 100.
const MAX_OWNER_LEN: usize = 39;
const MAX_REPO_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    owner: String,
    repo: String,
}

impl CacheKey {
    /// Build a key from separate owner and repository path segments.
    pub fn new(owner: &str, repo: &str) -> Result<Self, CardError> {
        let owner = normalize_segment(owner, "owner", MAX_OWNER_LEN)?;
        let repo = repo.trim();
        let repo = normalize_segment(repo.strip_suffix(".git").unwrap_or(repo), "repo", MAX_REPO_LEN)?;
        Ok(Self { owner, repo })
    }

    /// Parse any of the accepted repository spellings:
    ///
    /// - `https://github.com/owner/repo` (optionally with `www.`, a trailing
    ///   slash, `.git`, or extra path such as `/tree/main`)
    /// - `github.com/owner/repo`
    /// - `owner/repo`
    pub fn from_repo_url(input: &str) -> Result<Self, CardError> {
        let mut rest = input.trim();
        rest = rest.split(['?', '#']).next().unwrap_or_default();

        if let Some((scheme, after)) = rest.split_once("://") {
            if !scheme.eq_ignore_ascii_case("https") && !scheme.eq_ignore_ascii_case("http") {
                return Err(CardError::InvalidIdentifier(format!(
                    "unsupported URL scheme: {scheme}"
                )));
            }
            let (host, path) = after.split_once('/').unwrap_or((after, ""));
            if !is_github_host(host) {
                return Err(CardError::InvalidIdentifier(format!(
                    "not a GitHub URL: {input}"
                )));
            }
            rest = path;
        } else if let Some((host, path)) = rest.split_once('/')
            && is_github_host(host)
        {
            rest = path;
        }

        let mut segments = rest.split('/').filter(|s| !s.is_empty());
        match (segments.next(), segments.next()) {
            (Some(owner), Some(repo)) => Self::new(owner, repo),
            _ => Err(CardError::InvalidIdentifier(format!(
                "expected owner/repo, got {input:?}"
            ))),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

fn is_github_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "github.com" || host == "www.github.com"
}

/// Validate a single path segment and return its normalized form.
///
/// Rejects empty values, traversal (`.` / `..`) and anything outside
/// `[A-Za-z0-9._-]`.
fn normalize_segment(segment: &str, label: &str, max_len: usize) -> Result<String, CardError> {
    let segment = segment.trim();
    if segment.is_empty() {
        return Err(CardError::InvalidIdentifier(format!("{label} must not be empty")));
    }
    if segment == "." || segment == ".." {
        return Err(CardError::InvalidIdentifier(format!("invalid {label}: {segment:?}")));
    }
    if segment.len() > max_len {
        return Err(CardError::InvalidIdentifier(format!(
            "{label} longer than {max_len} characters"
        )));
    }
    if let Some(bad) = segment
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(CardError::InvalidIdentifier(format!(
            "invalid character {bad:?} in {label}: {segment:?}"
        )));
    }
    Ok(segment.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(owner: &str, repo: &str) -> CacheKey {
        CacheKey::new(owner, repo).unwrap()
    }

    #[test]
    fn new_lowercases_and_strips_git_suffix() {
        let k = key("Acme", "Widgets.git");
        assert_eq!(k.owner(), "acme");
        assert_eq!(k.repo(), "widgets");
        assert_eq!(k.to_string(), "acme/widgets");
    }

    #[test]
    fn git_suffix_is_stripped_once() {
        assert_eq!(key("acme", "widgets.git.git").repo(), "widgets.git");
        assert_eq!(key("acme", "widgets.git").repo(), "widgets");
    }

    #[test]
    fn case_variants_share_one_key() {
        assert_eq!(key("ACME", "WIDGETS"), key("acme", "widgets"));
    }

    #[test]
    fn new_rejects_traversal_and_separators() {
        for (owner, repo) in [
            ("..", "widgets"),
            ("acme", "."),
            ("ac/me", "widgets"),
            ("acme", "wid\\gets"),
            ("acme", "wid\0gets"),
            ("", "widgets"),
            ("acme", ".git"),
            ("acme", "wid gets"),
            ("acme", "<script>"),
        ] {
            let err = CacheKey::new(owner, repo).unwrap_err();
            assert!(
                matches!(err, CardError::InvalidIdentifier(_)),
                "{owner:?}/{repo:?} should be invalid"
            );
        }
    }

    #[test]
    fn new_accepts_dots_that_are_not_traversal() {
        assert_eq!(key("acme", ".github").repo(), ".github");
        assert_eq!(key("acme", "my_repo.v2").repo(), "my_repo.v2");
    }

    #[test]
    fn new_rejects_overlong_owner() {
        let owner = "a".repeat(40);
        assert!(CacheKey::new(&owner, "widgets").is_err());
    }

    #[test]
    fn from_repo_url_accepts_common_spellings() {
        let expected = key("python", "cpython");
        for input in [
            "https://github.com/python/cpython",
            "https://github.com/python/cpython/",
            "http://www.github.com/python/cpython.git",
            "github.com/python/cpython",
            "python/cpython",
            "  https://github.com/Python/CPython/tree/main  ",
            "https://github.com/python/cpython?tab=readme",
        ] {
            assert_eq!(CacheKey::from_repo_url(input).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn from_repo_url_rejects_other_hosts_and_short_paths() {
        for input in [
            "https://gitlab.com/python/cpython",
            "ftp://github.com/python/cpython",
            "https://github.com/python",
            "cpython",
            "",
        ] {
            assert!(
                matches!(
                    CacheKey::from_repo_url(input),
                    Err(CardError::InvalidIdentifier(_))
                ),
                "{input:?}"
            );
        }
    }
}
