//! Sensitive-Column Masking
//!
//! Decides which result columns carry sensitive data and must have every
//! cell replaced with the mask literal before leaving the process. The
//! decision is computed once per result set (per column, not per cell)
//! and consumed by the formatter.
//!
//! A column is sensitive when its case-folded name contains any rule
//! fragment as a substring: `password_hash` matches `password`. Built-in
//! fragments cover authentication, financial, and personal-identifier
//! categories; user-supplied fragments are unioned in, never replacing
//! the built-ins.

/// Fixed literal substituted for every cell of a sensitive column,
/// including NULLs. Masking takes precedence over null formatting.
pub const MASK_LITERAL: &str = "******";

/// Built-in sensitive-column name fragments, all lower-case.
pub const BUILTIN_FRAGMENTS: &[&str] = &[
    // authentication
    "password",
    "passwd",
    "pwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_key",
    "private_key",
    "credential",
    "auth",
    "authorization",
    // financial
    "credit_card",
    "creditcard",
    "card_number",
    "cardnumber",
    "cvv",
    "cvc",
    "pin",
    "bank_account",
    "account_number",
    "iban",
    "swift",
    // personal identifiers
    "ssn",
    "social_security",
    "id_card",
    "idcard",
    "passport",
];

/// Immutable set of mask-rule fragments, normalized to lower-case at load.
#[derive(Debug, Clone)]
pub struct MaskRuleSet {
    fragments: Vec<String>,
}

impl Default for MaskRuleSet {
    fn default() -> Self {
        Self::new("")
    }
}

impl MaskRuleSet {
    /// Build the rule set from the built-ins plus a user-supplied
    /// comma-separated extension list (`--mask-patterns`).
    #[must_use]
    pub fn new(extra_patterns: &str) -> Self {
        let mut fragments: Vec<String> =
            BUILTIN_FRAGMENTS.iter().map(|f| (*f).to_string()).collect();
        for pattern in extra_patterns.split(',') {
            let pattern = pattern.trim().to_lowercase();
            if !pattern.is_empty() && !fragments.contains(&pattern) {
                fragments.push(pattern);
            }
        }
        Self { fragments }
    }

    /// Whether a single column name matches any fragment.
    #[must_use]
    pub fn is_sensitive(&self, column: &str) -> bool {
        if column.is_empty() {
            return false;
        }
        let folded = column.to_lowercase();
        self.fragments.iter().any(|f| folded.contains(f.as_str()))
    }

    #[must_use]
    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }
}

/// The masking engine: rule set plus the global enable switch.
///
/// When masking is disabled the engine is bypassed entirely: every
/// column passes through unchanged. The switch is binary; there is no
/// per-column override.
#[derive(Debug, Clone)]
pub struct Masker {
    enabled: bool,
    rules: MaskRuleSet,
}

impl Masker {
    #[must_use]
    pub fn new(enabled: bool, rules: MaskRuleSet) -> Self {
        Self { enabled, rules }
    }

    /// Masking engine with default rules, enabled. Used by tests.
    #[must_use]
    pub fn enabled_default() -> Self {
        Self::new(true, MaskRuleSet::default())
    }

    /// No-op engine (masking disabled).
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(false, MaskRuleSet::default())
    }

    /// Precompute the per-column mask decision for a result set.
    ///
    /// Returns one boolean per column, in column order. All-false when
    /// masking is disabled.
    #[must_use]
    pub fn column_mask(&self, columns: &[String]) -> Vec<bool> {
        if !self.enabled {
            return vec![false; columns.len()];
        }
        columns.iter().map(|c| self.rules.is_sensitive(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exact_and_case_insensitive_match() {
        let rules = MaskRuleSet::default();
        assert!(rules.is_sensitive("password"));
        assert!(rules.is_sensitive("PASSWORD"));
        assert!(rules.is_sensitive("Password"));
        assert!(rules.is_sensitive("secret"));
        assert!(rules.is_sensitive("token"));
    }

    #[test]
    fn test_substring_match() {
        let rules = MaskRuleSet::default();
        assert!(rules.is_sensitive("user_password"));
        assert!(rules.is_sensitive("password_hash"));
        assert!(rules.is_sensitive("api_token"));
        assert!(rules.is_sensitive("access_token_secret"));
    }

    #[test]
    fn test_financial_and_personal_fragments() {
        let rules = MaskRuleSet::default();
        assert!(rules.is_sensitive("credit_card"));
        assert!(rules.is_sensitive("creditcard_number"));
        assert!(rules.is_sensitive("cvv"));
        assert!(rules.is_sensitive("bank_account_id"));
        assert!(rules.is_sensitive("iban_code"));
        assert!(rules.is_sensitive("ssn"));
        assert!(rules.is_sensitive("social_security_number"));
        assert!(rules.is_sensitive("passport_number"));
        assert!(rules.is_sensitive("id_card"));
    }

    #[test]
    fn test_non_sensitive_columns() {
        let rules = MaskRuleSet::default();
        for name in ["id", "name", "email", "created_at", "user_id", ""] {
            assert!(!rules.is_sensitive(name), "false positive: {name}");
        }
    }

    #[test]
    fn test_user_fragments_union_builtins() {
        let rules = MaskRuleSet::new("phone, address");
        assert!(rules.is_sensitive("phone_number"));
        assert!(rules.is_sensitive("home_address"));
        // built-ins never replaced
        assert!(rules.is_sensitive("password"));
    }

    #[test]
    fn test_extension_list_normalized() {
        let rules = MaskRuleSet::new(" PHONE ,, ,Email_Addr");
        assert!(rules.is_sensitive("phone"));
        assert!(rules.is_sensitive("EMAIL_ADDR_2"));
        // empty entries are dropped, not treated as match-everything
        assert!(!rules.is_sensitive("plain"));
    }

    #[test]
    fn test_column_mask_order_and_decision() {
        let masker = Masker::enabled_default();
        let columns = vec!["id".to_string(), "password".to_string(), "name".to_string()];
        assert_eq!(masker.column_mask(&columns), vec![false, true, false]);
    }

    #[test]
    fn test_disabled_masker_bypasses_rules() {
        let masker = Masker::disabled();
        let columns = vec!["password".to_string(), "ssn".to_string()];
        // columns are kept, only substitution stops
        assert_eq!(masker.column_mask(&columns), vec![false, false]);
    }
}
