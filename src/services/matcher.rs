//! Repo group matching.
//!
//! A repo group is an (include, exclude) regex pair evaluated with search
//! semantics against repository names. Exclude takes precedence over
//! include; a missing or empty include matches everything. Output order is
//! lexicographic by name so repeated calls over the same inputs are stable.

use crate::error::{AppError, Result};
use regex::Regex;

/// Compiled include/exclude pair.
#[derive(Debug)]
pub struct RepoMatcher {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl RepoMatcher {
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                AppError::Validation(format!("invalid repo pattern '{pattern}': {e}"))
            })
        };

        Ok(Self {
            include: match include {
                Some(p) if !p.is_empty() => Some(compile(p)?),
                _ => None,
            },
            exclude: match exclude {
                Some(p) if !p.is_empty() => Some(compile(p)?),
                _ => None,
            },
        })
    }

    /// Whether a repository name is selected by this group.
    pub fn matches(&self, name: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(name) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(name),
            None => true,
        }
    }

    /// Filter arbitrary items by their repository name, returning them in
    /// lexicographic name order.
    pub fn filter<T, F>(&self, items: Vec<T>, name_of: F) -> Vec<T>
    where
        F: Fn(&T) -> &str,
    {
        let mut selected: Vec<T> = items
            .into_iter()
            .filter(|item| self.matches(name_of(item)))
            .collect();
        selected.sort_by(|a, b| name_of(a).cmp(name_of(b)));
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(matcher: &RepoMatcher, input: &[&str]) -> Vec<String> {
        matcher.filter(
            input.iter().map(|s| s.to_string()).collect(),
            |s: &String| s.as_str(),
        )
    }

    #[test]
    fn test_no_patterns_matches_all() {
        let matcher = RepoMatcher::new(None, None).unwrap();
        assert_eq!(
            names(&matcher, &["b", "a", "c"]),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_empty_include_matches_all() {
        let matcher = RepoMatcher::new(Some(""), None).unwrap();
        assert!(matcher.matches("anything"));
    }

    #[test]
    fn test_include_only() {
        let matcher = RepoMatcher::new(Some("^ext-"), None).unwrap();
        assert!(matcher.matches("ext-centos7"));
        assert!(!matcher.matches("corp-tools"));
    }

    #[test]
    fn test_exclude_only() {
        let matcher = RepoMatcher::new(None, Some("-staging$")).unwrap();
        assert!(matcher.matches("ext-centos7"));
        assert!(!matcher.matches("ext-centos7-staging"));
    }

    #[test]
    fn test_exclude_takes_precedence() {
        // Repos = {ext-a, ext-b, ext-banned}; include=^ext-, exclude=banned$
        let matcher = RepoMatcher::new(Some("^ext-"), Some("banned$")).unwrap();
        assert_eq!(
            names(&matcher, &["ext-banned", "ext-b", "ext-a"]),
            vec!["ext-a".to_string(), "ext-b".to_string()]
        );
    }

    #[test]
    fn test_search_semantics_not_anchored() {
        let matcher = RepoMatcher::new(Some("centos"), None).unwrap();
        assert!(matcher.matches("ext-centos7-x86_64"));
    }

    #[test]
    fn test_ordering_is_lexicographic_and_stable() {
        let matcher = RepoMatcher::new(Some("repo"), None).unwrap();
        let first = names(&matcher, &["repo-10", "repo-2", "repo-1"]);
        let second = names(&matcher, &["repo-2", "repo-1", "repo-10"]);
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                "repo-1".to_string(),
                "repo-10".to_string(),
                "repo-2".to_string()
            ]
        );
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(RepoMatcher::new(Some("[unclosed"), None).is_err());
        assert!(RepoMatcher::new(None, Some("(?P<broken")).is_err());
    }

    #[test]
    fn test_set_equality_property() {
        // match(I, E, R) == {r : (I==null or I matches r) and not (E!=null and E matches r)}
        let repos = ["ext-a", "ext-b", "int-a", "int-b-old", "ext-c-old"];
        let matcher = RepoMatcher::new(Some("^ext-"), Some("-old$")).unwrap();
        let expected: Vec<&str> = repos
            .iter()
            .copied()
            .filter(|r| r.starts_with("ext-") && !r.ends_with("-old"))
            .collect();
        let actual = names(&matcher, &repos);
        assert_eq!(actual, expected);
    }
}
