//! Query Admission Control
//!
//! This module implements the statement classifier and the security gate
//! that sit between every incoming request and the database. The gate is
//! lexical: it splits the raw query text into top-level statements,
//! strips comments, and scans a case-folded token stream against an
//! explicit deny-rule table. It is not a SQL parser.
//!
//! # Validation Strategy
//! - Conservative, fail-closed: one denied statement rejects the whole request
//! - Keyword matches are word-boundary-respecting but not clause-scoped;
//!   a denied verb inside a subquery or a string literal still denies
//! - Comments are replaced with a space before matching, so splices like
//!   `DROP/**/TABLE` do not hide keywords
//! - Encoding-bypass heuristics deny hex literals and decoder functions
//!   (`UNHEX(`, `CHAR(`) regardless of context
//!
//! The gate is a pure function of the query text and the loaded policy;
//! re-classifying the same text yields the same result.

use std::fmt;

use crate::error::{Result, ServerError};

/// Leading verbs whose statements produce a result set rather than an
/// affected-row count. Membership here does not bypass the deny scan.
pub const READ_VERBS: &[&str] = &["SELECT", "SHOW", "DESC", "DESCRIBE", "EXPLAIN", "TQL", "WITH"];

/// Category of a deny rule, reported on violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCategory {
    /// Schema/privilege changes: DROP, CREATE, ALTER, TRUNCATE, GRANT, REVOKE
    Ddl,
    /// Data modification: INSERT, UPDATE, DELETE, REPLACE
    Dml,
    /// Dynamic execution: EXEC, EXECUTE, CALL
    DynamicExec,
    /// Filesystem access: LOAD, COPY, OUTFILE, LOAD_FILE, DUMPFILE
    Filesystem,
    /// Hex literals and decoder functions used to reconstruct denied keywords
    EncodingBypass,
}

impl RuleCategory {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ddl => "DDL",
            Self::Dml => "DML",
            Self::DynamicExec => "dynamic-execution",
            Self::Filesystem => "filesystem-access",
            Self::EncodingBypass => "encoding-bypass",
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rule severity, carried into the audit trail on violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Destructive or exfiltrating operations
    Critical,
    /// Policy violations without direct data loss
    High,
}

/// How a rule's pattern is matched against the token stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    /// The keyword as a standalone word anywhere in the statement
    Keyword,
    /// The keyword immediately followed by `(` (a function call)
    FunctionCall,
}

/// A single entry of the deny-rule table.
#[derive(Debug, Clone, Copy)]
pub struct DenyRule {
    pub category: RuleCategory,
    pub severity: Severity,
    keyword: &'static str,
    kind: MatchKind,
}

const DENY_RULES: &[DenyRule] = &[
    // DDL
    DenyRule { category: RuleCategory::Ddl, severity: Severity::Critical, keyword: "DROP", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Ddl, severity: Severity::Critical, keyword: "CREATE", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Ddl, severity: Severity::Critical, keyword: "ALTER", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Ddl, severity: Severity::Critical, keyword: "TRUNCATE", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Ddl, severity: Severity::Critical, keyword: "GRANT", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Ddl, severity: Severity::Critical, keyword: "REVOKE", kind: MatchKind::Keyword },
    // DML
    DenyRule { category: RuleCategory::Dml, severity: Severity::High, keyword: "INSERT", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Dml, severity: Severity::High, keyword: "UPDATE", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Dml, severity: Severity::Critical, keyword: "DELETE", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Dml, severity: Severity::High, keyword: "REPLACE", kind: MatchKind::Keyword },
    // Dynamic execution
    DenyRule { category: RuleCategory::DynamicExec, severity: Severity::Critical, keyword: "EXEC", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::DynamicExec, severity: Severity::Critical, keyword: "EXECUTE", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::DynamicExec, severity: Severity::Critical, keyword: "CALL", kind: MatchKind::Keyword },
    // Filesystem access
    DenyRule { category: RuleCategory::Filesystem, severity: Severity::Critical, keyword: "LOAD", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Filesystem, severity: Severity::Critical, keyword: "COPY", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Filesystem, severity: Severity::Critical, keyword: "OUTFILE", kind: MatchKind::Keyword },
    DenyRule { category: RuleCategory::Filesystem, severity: Severity::Critical, keyword: "LOAD_FILE", kind: MatchKind::FunctionCall },
    DenyRule { category: RuleCategory::Filesystem, severity: Severity::Critical, keyword: "DUMPFILE", kind: MatchKind::Keyword },
    // Encoding bypass (decoder functions; hex literals are scanned separately)
    DenyRule { category: RuleCategory::EncodingBypass, severity: Severity::High, keyword: "UNHEX", kind: MatchKind::FunctionCall },
    DenyRule { category: RuleCategory::EncodingBypass, severity: Severity::High, keyword: "CHAR", kind: MatchKind::FunctionCall },
];

/// The admission policy: an ordered, immutable deny-rule table.
///
/// Constructed once at startup and passed by reference into the gate, so
/// tests can run parallel instances with different policies.
#[derive(Debug, Clone)]
pub struct DenyPolicy {
    rules: Vec<DenyRule>,
}

impl Default for DenyPolicy {
    fn default() -> Self {
        Self { rules: DENY_RULES.to_vec() }
    }
}

impl DenyPolicy {
    /// The built-in deny-rule table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rules(&self) -> &[DenyRule] {
        &self.rules
    }
}

/// A single top-level statement produced by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Statement text with comments stripped, original casing preserved
    pub text: String,
    /// Case-folded leading keyword, empty for degenerate statements
    pub verb: String,
}

/// Outcome of classifying a request. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub allowed: bool,
    pub violated_rule: Option<RuleCategory>,
    /// The offending statement text, kept for the audit trail only.
    pub matched_statement: Option<String>,
}

impl ClassificationResult {
    const fn allowed() -> Self {
        Self { allowed: true, violated_rule: None, matched_statement: None }
    }

    fn denied(category: RuleCategory, statement: &Statement) -> Self {
        Self {
            allowed: false,
            violated_rule: Some(category),
            matched_statement: Some(statement.text.clone()),
        }
    }
}

/// Split raw query text into top-level statements.
///
/// Statements are split on `;` outside quoted strings and comments.
/// Quoting grammar: `'...'`, `"..."`, and `` `...` `` open strings; a
/// doubled closing quote stays inside; backslash escapes the next
/// character. `--` line comments and `/* */` block comments are replaced
/// with a single space. A trailing separator yields no empty statement.
///
/// # Errors
/// Returns `InvalidInput` for empty or whitespace-only input. This is a
/// validation failure, not a security violation; it never reaches the gate.
pub fn split_statements(query: &str) -> Result<Vec<Statement>> {
    if query.trim().is_empty() {
        return Err(ServerError::invalid_input("Query is required"));
    }

    #[derive(PartialEq)]
    enum State {
        Normal,
        Quoted(char),
        LineComment,
        BlockComment,
    }

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = query.chars().peekable();

    while let Some(ch) = chars.next() {
        match state {
            State::Normal => match ch {
                ';' => {
                    push_statement(&mut statements, &mut current);
                }
                '\'' | '"' | '`' => {
                    state = State::Quoted(ch);
                    current.push(ch);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                }
                _ => current.push(ch),
            },
            State::Quoted(quote) => {
                current.push(ch);
                if ch == '\\' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else if ch == quote {
                    if chars.peek() == Some(&quote) {
                        // doubled quote stays inside the string
                        current.push(quote);
                        chars.next();
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::LineComment => {
                if ch == '\n' {
                    current.push('\n');
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    current.push(' ');
                    state = State::Normal;
                }
            }
        }
    }
    // Unterminated strings or comments fall through here; the partial
    // statement is kept and still scanned (fail closed).
    push_statement(&mut statements, &mut current);

    if statements.is_empty() {
        return Err(ServerError::invalid_input("Query is required"));
    }
    Ok(statements)
}

fn push_statement(statements: &mut Vec<Statement>, current: &mut String) {
    let text = current.trim().to_string();
    current.clear();
    if text.is_empty() {
        return;
    }
    let verb = text
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .find(|w| !w.is_empty())
        .map(str::to_ascii_uppercase)
        .unwrap_or_default();
    statements.push(Statement { text, verb });
}

/// Classify a request under the given policy.
///
/// Deny wins over allow for the whole request: the first statement that
/// violates any rule rejects the entire input.
///
/// # Errors
/// Returns `InvalidInput` for empty input (from the classifier). Gate
/// denials are reported in the returned `ClassificationResult`, not as
/// errors, so callers can decide how to surface them.
pub fn classify(query: &str, policy: &DenyPolicy) -> Result<ClassificationResult> {
    let statements = split_statements(query)?;

    for statement in &statements {
        let folded = statement.text.to_ascii_uppercase();
        let tokens = tokenize(&folded);

        for rule in policy.rules() {
            let hit = tokens.iter().any(|(word, next)| {
                word == rule.keyword
                    && match rule.kind {
                        MatchKind::Keyword => true,
                        MatchKind::FunctionCall => *next == Some('('),
                    }
            });
            if hit {
                tracing::warn!(
                    category = rule.category.as_str(),
                    severity = ?rule.severity,
                    "security gate denied statement"
                );
                return Ok(ClassificationResult::denied(rule.category, statement));
            }
        }

        // Hex literal heuristic: 0x followed by hex digits, anywhere.
        if tokens.iter().any(|(word, _)| is_hex_literal(word)) {
            tracing::warn!(category = "encoding-bypass", "security gate denied hex literal");
            return Ok(ClassificationResult::denied(RuleCategory::EncodingBypass, statement));
        }
    }

    Ok(ClassificationResult::allowed())
}

/// Classify and convert a denial into a `SecurityViolation` error.
pub fn enforce(query: &str, policy: &DenyPolicy) -> Result<()> {
    let result = classify(query, policy)?;
    match result.violated_rule {
        Some(category) => Err(ServerError::SecurityViolation(category)),
        None => Ok(()),
    }
}

/// Split a case-folded statement into word tokens, each paired with the
/// first non-whitespace character that follows it (for call detection).
fn tokenize(folded: &str) -> Vec<(String, Option<char>)> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut chars = folded.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            word.push(ch);
            continue;
        }
        if !word.is_empty() {
            let next = if ch.is_whitespace() {
                let mut look = ch;
                while look.is_whitespace() {
                    match chars.peek() {
                        Some(&c) => {
                            look = c;
                            if !c.is_whitespace() {
                                break;
                            }
                            chars.next();
                        }
                        None => break,
                    }
                }
                if look.is_whitespace() { None } else { Some(look) }
            } else {
                Some(ch)
            };
            tokens.push((std::mem::take(&mut word), next));
        }
    }
    if !word.is_empty() {
        tokens.push((word, None));
    }
    tokens
}

fn is_hex_literal(word: &str) -> bool {
    word.len() > 2
        && word.starts_with("0X")
        && word[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn gate(query: &str) -> ClassificationResult {
        classify(query, &DenyPolicy::new()).expect("non-empty query")
    }

    // Classifier tests

    #[test]
    fn test_empty_query_is_validation_error() {
        assert!(split_statements("").is_err());
        assert!(split_statements("   \n\t").is_err());
        assert!(matches!(
            classify("", &DenyPolicy::new()),
            Err(ServerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_trailing_separator_not_extra_statement() {
        let stmts = split_statements("SELECT 1;").unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].verb, "SELECT");
    }

    #[test]
    fn test_multi_statement_split() {
        let stmts = split_statements("SELECT 1; SHOW TABLES").unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].verb, "SELECT");
        assert_eq!(stmts[1].verb, "SHOW");
    }

    #[test]
    fn test_separator_inside_quotes_not_split() {
        let stmts = split_statements("SELECT 'a;b' FROM t").unwrap();
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn test_doubled_quote_stays_in_string() {
        let stmts = split_statements("SELECT 'it''s; fine' FROM t").unwrap();
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn test_comments_stripped() {
        let stmts = split_statements("SELECT 1 -- trailing; comment\nFROM t").unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(!stmts[0].text.contains("comment"));
    }

    #[test]
    fn test_original_casing_preserved() {
        let stmts = split_statements("SeLeCt * FrOm users").unwrap();
        assert_eq!(stmts[0].text, "SeLeCt * FrOm users");
        assert_eq!(stmts[0].verb, "SELECT");
    }

    // Gate: allowed statements

    #[test]
    fn test_select_allowed() {
        assert!(gate("SELECT * FROM users").allowed);
        assert!(gate("select * from users").allowed);
    }

    #[test]
    fn test_show_desc_explain_allowed() {
        assert!(gate("SHOW TABLES").allowed);
        assert!(gate("DESCRIBE users").allowed);
        assert!(gate("DESC users").allowed);
        assert!(gate("EXPLAIN SELECT * FROM users").allowed);
    }

    #[test]
    fn test_tql_allowed() {
        assert!(gate("TQL EVAL ('now-1h', 'now', '1m') rate(x[5m])").allowed);
    }

    #[test]
    fn test_cte_allowed() {
        assert!(gate("WITH t AS (SELECT 1) SELECT * FROM t").allowed);
    }

    #[test]
    fn test_union_and_information_schema_allowed() {
        assert!(gate("SELECT * FROM users UNION SELECT * FROM admins").allowed);
        assert!(gate("SELECT * FROM INFORMATION_SCHEMA.TABLES").allowed);
    }

    #[test]
    fn test_multi_statement_all_safe_allowed() {
        assert!(gate("SELECT * FROM users; SELECT * FROM test").allowed);
    }

    // Gate: DDL / DML

    #[test]
    fn test_ddl_denied() {
        for q in [
            "DROP TABLE users",
            "CREATE TABLE t (id INT)",
            "ALTER TABLE users ADD COLUMN x INT",
            "TRUNCATE TABLE users",
            "GRANT SELECT ON users TO u",
            "REVOKE SELECT ON users FROM u",
        ] {
            let result = gate(q);
            assert!(!result.allowed, "expected denial: {q}");
            assert_eq!(result.violated_rule, Some(RuleCategory::Ddl));
        }
    }

    #[test]
    fn test_dml_denied() {
        for q in [
            "INSERT INTO users VALUES (1)",
            "UPDATE users SET name='x'",
            "DELETE FROM users",
            "REPLACE INTO users VALUES (1, 'x')",
        ] {
            let result = gate(q);
            assert!(!result.allowed, "expected denial: {q}");
            assert_eq!(result.violated_rule, Some(RuleCategory::Dml));
        }
    }

    #[test]
    fn test_denied_inside_subquery() {
        let result = gate("SELECT * FROM (SELECT 1) x WHERE EXISTS (DELETE FROM t)");
        assert!(!result.allowed);
    }

    #[test]
    fn test_multi_statement_one_bad_denies_all() {
        let result = gate("SELECT 1; DROP TABLE t;");
        assert!(!result.allowed);
        assert_eq!(result.violated_rule, Some(RuleCategory::Ddl));
        assert_eq!(result.matched_statement.as_deref(), Some("DROP TABLE t"));
    }

    #[test]
    fn test_comment_splice_denied() {
        assert!(!gate("DROP/**/TABLE users").allowed);
        assert!(!gate("DROP--comment\nTABLE users").allowed);
    }

    #[test]
    fn test_word_boundary_respected() {
        // UPDATED_AT is a column name, not the UPDATE verb
        assert!(gate("SELECT updated_at FROM users").allowed);
        assert!(gate("SELECT dropped, created FROM audit_log").allowed);
    }

    // Gate: dynamic execution / filesystem

    #[test]
    fn test_dynamic_execution_denied() {
        for q in [
            "EXEC sp_executesql 'SELECT 1'",
            "EXECUTE immediate 'SELECT * FROM users'",
            "CALL stored_procedure()",
        ] {
            let result = gate(q);
            assert!(!result.allowed, "expected denial: {q}");
            assert_eq!(result.violated_rule, Some(RuleCategory::DynamicExec));
        }
    }

    #[test]
    fn test_filesystem_denied() {
        for q in [
            "LOAD DATA INFILE '/etc/passwd' INTO TABLE users",
            "COPY users TO '/tmp/data.csv'",
            "SELECT * FROM users INTO OUTFILE '/tmp/u.txt'",
            "SELECT LOAD_FILE('/etc/passwd')",
            "SELECT 'x' INTO DUMPFILE '/tmp/x.txt'",
        ] {
            let result = gate(q);
            assert!(!result.allowed, "expected denial: {q}");
            assert_eq!(result.violated_rule, Some(RuleCategory::Filesystem));
        }
    }

    // Gate: encoding bypass

    #[test]
    fn test_hex_literal_denied() {
        let result = gate("SELECT 0x44524f50205441424c45");
        assert!(!result.allowed);
        assert_eq!(result.violated_rule, Some(RuleCategory::EncodingBypass));
    }

    #[test]
    fn test_unhex_denied() {
        let result = gate("SELECT UNHEX('44524f50207461626c65')");
        assert!(!result.allowed);
        assert_eq!(result.violated_rule, Some(RuleCategory::EncodingBypass));
    }

    #[test]
    fn test_char_function_denied_but_varchar_allowed() {
        let result = gate("SELECT CHAR(68,82,79,80)");
        assert!(!result.allowed);
        assert_eq!(result.violated_rule, Some(RuleCategory::EncodingBypass));

        assert!(gate("SELECT name FROM t WHERE kind = 'varchar'").allowed);
    }

    // Purity / idempotence

    #[test]
    fn test_classification_idempotent() {
        let policy = DenyPolicy::new();
        let first = classify("SELECT password FROM users", &policy).unwrap();
        let second = classify("SELECT password FROM users", &policy).unwrap();
        assert_eq!(first, second);
        assert!(first.allowed);
    }

    #[test]
    fn test_enforce_maps_to_security_violation() {
        let err = enforce("DROP TABLE t", &DenyPolicy::new()).unwrap_err();
        assert_eq!(err.error_code(), "SECURITY");
    }
}
