//! Allow-list gate on the reporting user

/// Users allowed through; an empty list lets everyone through
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    allowed: Vec<String>,
}

impl UserFilter {
    /// Build from a comma-separated list such as `alice,bob`
    pub fn from_list(list: &str) -> Self {
        let allowed = list
            .split(',')
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(str::to_string)
            .collect();
        Self { allowed }
    }

    pub fn is_active(&self) -> bool {
        !self.allowed.is_empty()
    }

    pub fn allows(&self, user: &str) -> bool {
        !self.is_active() || self.allowed.iter().any(|allowed| allowed == user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_everyone() {
        let filter = UserFilter::from_list("");
        assert!(!filter.is_active());
        assert!(filter.allows("carol"));
        assert!(filter.allows(""));
    }

    #[test]
    fn list_restricts_to_named_users() {
        let filter = UserFilter::from_list("alice,bob");
        assert!(filter.allows("alice"));
        assert!(filter.allows("bob"));
        assert!(!filter.allows("carol"));
        assert!(!filter.allows(""));
    }

    #[test]
    fn entries_are_trimmed() {
        let filter = UserFilter::from_list(" alice , bob ,");
        assert!(filter.allows("alice"));
        assert!(filter.allows("bob"));
    }
}
