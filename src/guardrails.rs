//! Pre-execution rule checks on generated SQL.
//!
//! The validator is keyword based and fails closed. Rules run in a fixed
//! order and the first violation wins:
//!
//! 1. exactly one statement (a single trailing `;` is allowed)
//! 2. the first keyword is `SELECT` or `WITH`
//! 3. no forbidden keyword (DDL/DML/transaction control) appears
//! 4. a `LIMIT <n>` clause is present
//!
//! String literals, quoted identifiers and comments are masked before any
//! rule runs, so `WHERE name = 'drop; table'` does not trip rules 1 or 3.
//! There is no semantic parsing: a destructive function call hidden in a
//! subquery is not detected.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::config::GuardrailConfig;

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^```(?:sql|postgresql|postgres)?\s*").unwrap());
static FENCE_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*```\s*$").unwrap());
static LIMIT_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blimit\s+(\d+)\b").unwrap());

/// The rule a candidate statement broke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Empty,
    MultipleStatements,
    NotSelect { first_keyword: String },
    ForbiddenKeyword { keyword: String },
    MissingLimit,
}

impl Violation {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Violation::Empty => "empty",
            Violation::MultipleStatements => "multiple_statements",
            Violation::NotSelect { .. } => "not_select",
            Violation::ForbiddenKeyword { .. } => "forbidden_keyword",
            Violation::MissingLimit => "missing_limit",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Empty => write!(f, "empty: no SQL statement was produced"),
            Violation::MultipleStatements => write!(
                f,
                "multiple_statements: produce exactly ONE statement, no ';'-separated sequences"
            ),
            Violation::NotSelect { first_keyword } => write!(
                f,
                "not_select: statement must start with SELECT or WITH (found '{}')",
                first_keyword
            ),
            Violation::ForbiddenKeyword { keyword } => write!(
                f,
                "forbidden_keyword: '{}' is not allowed; read-only queries only",
                keyword.to_uppercase()
            ),
            Violation::MissingLimit => {
                write!(f, "missing_limit: the query must include a LIMIT clause")
            }
        }
    }
}

/// Rule set applied to every candidate statement.
#[derive(Debug, Clone)]
pub struct Guardrails {
    enabled: bool,
    max_limit: u64,
    append_missing_limit: bool,
    forbidden: Vec<Regex>,
    forbidden_words: Vec<String>,
}

impl Guardrails {
    pub fn new(config: &GuardrailConfig) -> Self {
        let (forbidden, forbidden_words): (Vec<Regex>, Vec<String>) = config
            .forbidden_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .filter_map(|kw| {
                Regex::new(&format!(r"\b{}\b", regex::escape(&kw)))
                    .ok()
                    .map(|re| (re, kw))
            })
            .unzip();
        Self {
            enabled: config.enabled,
            max_limit: config.max_limit,
            append_missing_limit: config.append_missing_limit,
            forbidden,
            forbidden_words,
        }
    }

    /// Check a statement against the rules, in order.
    pub fn check(&self, sql: &str) -> Result<(), Violation> {
        let masked = mask_literals(sql);
        let body = masked.trim();
        let body = body.strip_suffix(';').unwrap_or(body).trim_end();

        if body.is_empty() {
            return Err(Violation::Empty);
        }

        if body.contains(';') {
            return Err(Violation::MultipleStatements);
        }

        let lower = body.to_lowercase();
        let first_keyword: String = lower
            .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        if first_keyword != "select" && first_keyword != "with" {
            return Err(Violation::NotSelect {
                first_keyword: first_keyword.to_uppercase(),
            });
        }

        for (re, word) in self.forbidden.iter().zip(&self.forbidden_words) {
            if re.is_match(&lower) {
                return Err(Violation::ForbiddenKeyword {
                    keyword: word.clone(),
                });
            }
        }

        if !LIMIT_CLAUSE.is_match(&lower) {
            return Err(Violation::MissingLimit);
        }

        Ok(())
    }

    /// Normalize model output and validate it.
    ///
    /// Strips code fences, optionally appends a missing LIMIT, validates,
    /// then clamps any LIMIT above the configured maximum. Returns the SQL
    /// that is safe to hand to the executor. With guardrails disabled only
    /// the fence stripping happens.
    pub fn validate(&self, sql: &str) -> Result<String, Violation> {
        let mut s = strip_code_fences(sql);
        if !self.enabled {
            return Ok(s);
        }
        if self.append_missing_limit && !LIMIT_CLAUSE.is_match(&mask_literals(&s)) {
            s = append_limit(&s, self.max_limit);
        }
        self.check(&s)?;
        Ok(clamp_limit(&s, self.max_limit))
    }
}

/// Remove surrounding Markdown code fences.
pub fn strip_code_fences(sql: &str) -> String {
    let s = sql.trim();
    let s = FENCE_OPEN.replace(s, "");
    let s = FENCE_CLOSE.replace(&s, "");
    s.trim().to_string()
}

/// Rewrite every `LIMIT n` with `n > max` to `LIMIT max`.
pub fn clamp_limit(sql: &str, max: u64) -> String {
    let masked = mask_literals(sql);
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for caps in LIMIT_CLAUSE.captures_iter(&masked) {
        let (Some(whole), Some(num)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let too_big = num.as_str().parse::<u64>().map(|n| n > max).unwrap_or(true);
        if too_big {
            out.push_str(&sql[last..whole.start()]);
            out.push_str(&format!("LIMIT {}", max));
            last = whole.end();
        }
    }
    out.push_str(&sql[last..]);
    out
}

/// Append `LIMIT n` to a statement, keeping a trailing `;`.
pub fn append_limit(sql: &str, limit: u64) -> String {
    let s = sql.trim_end();
    let s = s.strip_suffix(';').unwrap_or(s).trim_end();
    format!("{}\nLIMIT {};", s, limit)
}

/// Replace the contents of string literals, quoted identifiers, dollar
/// quoted bodies and comments with spaces.
///
/// The output has the same byte length as the input, so match offsets
/// found in the masked text are valid in the original.
pub fn mask_literals(sql: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        Single,
        Double,
        LineComment,
        BlockComment,
        Dollar,
    }

    let bytes = sql.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut state = State::Code;
    let mut dollar_tag: Vec<u8> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match state {
            State::Code => match b {
                b'\'' => {
                    state = State::Single;
                    out.push(b);
                }
                b'"' => {
                    state = State::Double;
                    out.push(b);
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    state = State::LineComment;
                    out.extend_from_slice(b"  ");
                    i += 1;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    state = State::BlockComment;
                    out.extend_from_slice(b"  ");
                    i += 1;
                }
                b'$' => {
                    let rest = &bytes[i + 1..];
                    let tag_len = rest
                        .iter()
                        .take_while(|c| c.is_ascii_alphanumeric() || **c == b'_')
                        .count();
                    if rest.get(tag_len) == Some(&b'$') {
                        dollar_tag = bytes[i..i + tag_len + 2].to_vec();
                        out.extend(std::iter::repeat(b' ').take(dollar_tag.len()));
                        i += dollar_tag.len();
                        state = State::Dollar;
                        continue;
                    }
                    out.push(b);
                }
                _ => out.push(b),
            },
            State::Single => {
                if b == b'\'' {
                    if bytes.get(i + 1) == Some(&b'\'') {
                        out.extend_from_slice(b"  ");
                        i += 2;
                        continue;
                    }
                    state = State::Code;
                    out.push(b);
                } else {
                    out.push(mask_byte(b));
                }
            }
            State::Double => {
                if b == b'"' {
                    state = State::Code;
                    out.push(b);
                } else {
                    out.push(mask_byte(b));
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Code;
                    out.push(b);
                } else {
                    out.push(mask_byte(b));
                }
            }
            State::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = State::Code;
                    out.extend_from_slice(b"  ");
                    i += 2;
                    continue;
                }
                out.push(mask_byte(b));
            }
            State::Dollar => {
                if bytes[i..].starts_with(&dollar_tag) {
                    out.extend(std::iter::repeat(b' ').take(dollar_tag.len()));
                    i += dollar_tag.len();
                    state = State::Code;
                    continue;
                }
                out.push(mask_byte(b));
            }
        }
        i += 1;
    }

    // State only changes on ASCII bytes, so a multi-byte character is either
    // copied whole or masked whole.
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Masked bytes become spaces, except non-ASCII bytes which are kept as
/// `x` so the byte length is unchanged and the result stays valid UTF-8.
fn mask_byte(b: u8) -> u8 {
    if b == b'\n' {
        b'\n'
    } else if b.is_ascii() {
        b' '
    } else {
        b'x'
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rails() -> Guardrails {
        Guardrails::new(&GuardrailConfig::default())
    }

    #[test]
    fn test_accepts_simple_select_with_limit() {
        assert_eq!(rails().check("SELECT * FROM customer LIMIT 10"), Ok(()));
        assert_eq!(rails().check("select name from artist limit 5;"), Ok(()));
    }

    #[test]
    fn test_accepts_with_clause() {
        let sql = "WITH t AS (SELECT 1 AS x) SELECT x FROM t LIMIT 1";
        assert_eq!(rails().check(sql), Ok(()));
    }

    #[test]
    fn test_rejects_multiple_statements() {
        for sql in [
            "SELECT 1 LIMIT 1; SELECT 2 LIMIT 1",
            "SELECT 1 LIMIT 1; DROP TABLE customer;",
            "SELECT * FROM a LIMIT 1;;",
        ] {
            assert_eq!(
                rails().check(sql),
                Err(Violation::MultipleStatements),
                "{}",
                sql
            );
        }
    }

    #[test]
    fn test_rejects_non_select() {
        for (sql, kw) in [
            ("DELETE FROM customer LIMIT 1", "DELETE"),
            ("update t set a = 1", "UPDATE"),
            ("EXPLAIN SELECT 1 LIMIT 1", "EXPLAIN"),
            ("  insert into t values (1)", "INSERT"),
        ] {
            assert_eq!(
                rails().check(sql),
                Err(Violation::NotSelect {
                    first_keyword: kw.to_string()
                })
            );
        }
    }

    #[test]
    fn test_rejects_missing_limit() {
        assert_eq!(
            rails().check("SELECT * FROM customer"),
            Err(Violation::MissingLimit)
        );
        // LIMIT inside a literal does not count
        assert_eq!(
            rails().check("SELECT 'limit 5' AS note FROM t"),
            Err(Violation::MissingLimit)
        );
    }

    #[test]
    fn test_rule_order_single_statement_first() {
        assert_eq!(
            rails().check("DROP TABLE a; DROP TABLE b"),
            Err(Violation::MultipleStatements)
        );
        assert_eq!(
            rails().check("DROP TABLE a"),
            Err(Violation::NotSelect {
                first_keyword: "DROP".into()
            })
        );
    }

    #[test]
    fn test_rejects_forbidden_keyword_in_cte() {
        let sql = "WITH d AS (DELETE FROM t RETURNING *) SELECT * FROM d LIMIT 5";
        assert_eq!(
            rails().check(sql),
            Err(Violation::ForbiddenKeyword {
                keyword: "delete".into()
            })
        );
    }

    #[test]
    fn test_literals_and_comments_are_masked() {
        let sql = "SELECT * FROM track WHERE name = 'Drop; Update' -- delete me\nLIMIT 5";
        assert_eq!(rails().check(sql), Ok(()));
        let sql = "SELECT \"create\" FROM t /* ; drop */ LIMIT 5";
        assert_eq!(rails().check(sql), Ok(()));
    }

    #[test]
    fn test_identifier_containing_keyword_is_allowed() {
        assert_eq!(
            rails().check("SELECT last_update, created_at FROM film LIMIT 5"),
            Ok(())
        );
    }

    #[test]
    fn test_empty_is_rejected() {
        assert_eq!(rails().check("   ;  "), Err(Violation::Empty));
    }

    #[test]
    fn test_validate_strips_fences_and_clamps() {
        let raw = "```sql\nSELECT * FROM invoice LIMIT 5000\n```";
        let sql = rails().validate(raw).unwrap();
        assert_eq!(sql, "SELECT * FROM invoice LIMIT 200");
    }

    #[test]
    fn test_validate_keeps_small_limit() {
        let sql = rails().validate("SELECT * FROM invoice LIMIT 5;").unwrap();
        assert_eq!(sql, "SELECT * FROM invoice LIMIT 5;");
    }

    #[test]
    fn test_validate_appends_limit_when_configured() {
        let cfg = GuardrailConfig {
            append_missing_limit: true,
            max_limit: 50,
            ..GuardrailConfig::default()
        };
        let sql = Guardrails::new(&cfg)
            .validate("SELECT * FROM artist;")
            .unwrap();
        assert_eq!(sql, "SELECT * FROM artist\nLIMIT 50;");
    }

    #[test]
    fn test_validate_without_append_rejects_missing_limit() {
        assert_eq!(
            rails().validate("SELECT * FROM artist"),
            Err(Violation::MissingLimit)
        );
    }

    #[test]
    fn test_mask_preserves_length_with_unicode() {
        let sql = "SELECT 'Helena Holý; x' FROM t LIMIT 1";
        let masked = mask_literals(sql);
        assert_eq!(masked.len(), sql.len());
        assert!(!masked.contains(';'));
    }

    #[test]
    fn test_dollar_quoted_body_masked() {
        let sql = "SELECT $tag$ ; drop $tag$ AS x LIMIT 1";
        assert_eq!(rails().check(sql), Ok(()));
    }

    #[test]
    fn test_clamp_limit_multiple_clauses() {
        let sql = "SELECT * FROM (SELECT * FROM a LIMIT 900) s LIMIT 10";
        assert_eq!(
            clamp_limit(sql, 100),
            "SELECT * FROM (SELECT * FROM a LIMIT 100) s LIMIT 10"
        );
    }

    #[test]
    fn test_violation_codes() {
        assert_eq!(Violation::MissingLimit.code(), "missing_limit");
        assert!(Violation::MultipleStatements
            .to_string()
            .starts_with("multiple_statements"));
    }
}
