use serde::{Deserialize, Serialize};

/// Billing tier for a user account. The tier is set externally by billing;
/// this crate only reads it to derive the message quota.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Pro,
    Enterprise,
    // Unrecognized plan values fall back to the free tier rather than
    // failing open to an unlimited quota.
    #[default]
    #[serde(other)]
    Free,
}

impl Plan {
    /// Monthly message quota for this tier.
    pub fn message_limit(self) -> u32 {
        match self {
            Plan::Free => 50,
            Plan::Pro => 1000,
            Plan::Enterprise => 10_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    /// Parse a stored plan string, treating anything unrecognized as free.
    pub fn parse(value: &str) -> Self {
        match value {
            "pro" => Plan::Pro,
            "enterprise" => Plan::Enterprise,
            _ => Plan::Free,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_limits() {
        assert_eq!(Plan::Free.message_limit(), 50);
        assert_eq!(Plan::Pro.message_limit(), 1000);
        assert_eq!(Plan::Enterprise.message_limit(), 10_000);
    }

    #[test]
    fn test_unknown_plan_deserializes_to_free() {
        let plan: Plan = serde_json::from_str("\"platinum\"").unwrap();
        assert_eq!(plan, Plan::Free);

        let plan: Plan = serde_json::from_str("\"enterprise\"").unwrap();
        assert_eq!(plan, Plan::Enterprise);
    }

    #[test]
    fn test_parse_is_fail_safe() {
        assert_eq!(Plan::parse("pro"), Plan::Pro);
        assert_eq!(Plan::parse(""), Plan::Free);
        assert_eq!(Plan::parse("PRO"), Plan::Free);
    }
}
