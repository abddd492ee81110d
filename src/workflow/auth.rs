//! Authorization Checks
//!
//! Sensitive phases are only entered when an [`Authorizer`] approves the
//! target. The scope passed is the phase name.

use std::collections::HashSet;

use log::debug;

/// External consent check consulted before sensitive phases.
pub trait Authorizer: Send + Sync {
    fn verify(&self, target: &str, scope: Option<&str>) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&str, Option<&str>) -> bool + Send + Sync,
{
    fn verify(&self, target: &str, scope: Option<&str>) -> bool {
        self(target, scope)
    }
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn verify(&self, _target: &str, _scope: Option<&str>) -> bool {
        true
    }
}

/// Denies everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn verify(&self, _target: &str, _scope: Option<&str>) -> bool {
        false
    }
}

/// Approves targets on an explicit list.
///
/// Entries match exactly (case-insensitive), or as a domain suffix when
/// written `*.example.com`.
#[derive(Debug, Clone, Default)]
pub struct ScopeList {
    exact: HashSet<String>,
    suffixes: Vec<String>,
}

impl ScopeList {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for target in targets {
            let target = target.as_ref().trim().to_ascii_lowercase();
            if target.is_empty() {
                continue;
            }
            match target.strip_prefix("*.") {
                Some(domain) => list.suffixes.push(format!(".{}", domain)),
                None => {
                    list.exact.insert(target);
                }
            }
        }
        list
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.suffixes.is_empty()
    }
}

impl Authorizer for ScopeList {
    fn verify(&self, target: &str, scope: Option<&str>) -> bool {
        let target = target.trim().to_ascii_lowercase();
        let approved = self.exact.contains(&target)
            || self.suffixes.iter().any(|suffix| target.ends_with(suffix.as_str()));
        debug!(
            "Authorization for '{}' ({}): {}",
            target,
            scope.unwrap_or("any"),
            if approved { "approved" } else { "denied" }
        );
        approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_answers() {
        assert!(AllowAll.verify("10.0.0.1", Some("exploitation")));
        assert!(!DenyAll.verify("10.0.0.1", None));
    }

    #[test]
    fn test_scope_list_exact_and_wildcard() {
        let scope = ScopeList::new(["10.0.0.5", "*.lab.example", "  "]);
        assert!(scope.verify("10.0.0.5", Some("exploitation")));
        assert!(scope.verify("WEB.lab.example", None));
        assert!(!scope.verify("lab.example", None));
        assert!(!scope.verify("10.0.0.6", None));
        assert!(!scope.is_empty());
        assert!(ScopeList::new(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_closure_authorizer_sees_scope() {
        let only_post = |_: &str, scope: Option<&str>| scope == Some("post_exploitation");
        assert!(only_post.verify("host", Some("post_exploitation")));
        assert!(!only_post.verify("host", Some("exploitation")));
    }
}
