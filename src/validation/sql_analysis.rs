//! Best-effort extraction of table and column names from configured SQL.
//!
//! This is a text heuristic, not a parser. It understands plain
//! `SELECT ... FROM ... JOIN ... WHERE ... ORDER BY` statements plus the
//! target tables of INSERT/UPDATE/DELETE. Anything it cannot follow
//! (common table expressions, sub-selects in FROM) is reported as
//! unanalyzable so the caller can downgrade it to a warning.

use regex::Regex;
use std::sync::LazyLock;

/// Tables and columns a statement appears to reference
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlReferences {
    pub tables: Vec<String>,
    pub columns: Vec<String>,
}

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("string literal regex"));
static LINE_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--[^\n]*").expect("line comment regex"));
static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("block comment regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

static LEADING_WITH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*WITH\b").expect("with regex"));
static NESTED_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:FROM|JOIN)\s*\(").expect("nested from regex"));

static SELECT_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*SELECT\s+(?:DISTINCT\s+|ALL\s+)?(.+?)\s+FROM\s").expect("select list regex")
});
static FROM_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bFROM\s+(.+?)(?:\s+(?:WHERE|GROUP\s+BY|ORDER\s+BY|HAVING|LIMIT|OFFSET|UNION|(?:(?:INNER|LEFT|RIGHT|FULL|CROSS|NATURAL)\s+)?(?:OUTER\s+)?JOIN)\b|$)",
    )
    .expect("from clause regex")
});
static JOIN_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bJOIN\s+([A-Za-z_][\w$]*(?:\.[A-Za-z_][\w$]*)?)(?:\s+(?:AS\s+)?([A-Za-z_][\w$]*))?").expect("join regex"));
static WRITE_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:INSERT\s+INTO|UPDATE|REPLACE\s+INTO)\s+([A-Za-z_][\w$]*(?:\.[A-Za-z_][\w$]*)?)")
        .expect("write target regex")
});
static WHERE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bWHERE\s+(.+?)(?:\s+(?:GROUP\s+BY|ORDER\s+BY|HAVING|LIMIT|OFFSET|UNION)\b|$)")
        .expect("where clause regex")
});
static ORDER_BY_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bORDER\s+BY\s+(.+?)(?:\s+(?:LIMIT|OFFSET|UNION|FETCH)\b|$)").expect("order by regex")
});
static COMPARED_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)([A-Za-z_][\w$]*(?:\.[A-Za-z_][\w$]*)?)\s*(?:=|<>|!=|<=|>=|<|>|\bNOT\s+LIKE\b|\bLIKE\b|\bILIKE\b|\bNOT\s+IN\b|\bIN\b|\bIS\b|\bBETWEEN\b)",
    )
    .expect("comparison regex")
});
static PLAIN_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([A-Za-z_][\w$]*(?:\.[A-Za-z_][\w$]*)?)(?:\s+(?:AS\s+)?([A-Za-z_][\w$]*))?$")
        .expect("identifier regex")
});

const RESERVED: [&str; 22] = [
    "AND", "OR", "NOT", "NULL", "TRUE", "FALSE", "IS", "IN", "LIKE", "BETWEEN", "EXISTS", "CASE",
    "WHEN", "THEN", "ELSE", "END", "ASC", "DESC", "NULLS", "FIRST", "LAST", "CURRENT_DATE",
];

/// Strip comments and string literals, drop identifier quotes, collapse whitespace
fn normalize(sql: &str) -> String {
    let text = BLOCK_COMMENT.replace_all(sql, " ");
    let text = LINE_COMMENT.replace_all(&text, " ");
    let text = STRING_LITERAL.replace_all(&text, "''");
    let text = text.replace(['"', '`'], "");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().trim_end_matches(';').trim().to_string()
}

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(word))
}

/// Last segment of a possibly qualified name
fn unqualified(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Split on commas that are not nested in parentheses
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (idx, c) in list.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(list[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(list[start..].trim());
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

fn push_unique(target: &mut Vec<String>, value: &str) {
    if !target.iter().any(|v| v.eq_ignore_ascii_case(value)) {
        target.push(value.to_string());
    }
}

/// Extract referenced tables and columns.
///
/// Returns `Err(reason)` when the statement uses constructs this heuristic
/// does not follow.
pub fn extract_references(sql: &str) -> Result<SqlReferences, String> {
    let text = normalize(sql);
    if text.is_empty() {
        return Err("SQL text is empty".to_string());
    }
    if LEADING_WITH.is_match(&text) {
        return Err("common table expressions are not analyzed".to_string());
    }
    if NESTED_FROM.is_match(&text) {
        return Err("sub-selects in FROM/JOIN are not analyzed".to_string());
    }

    let mut refs = SqlReferences::default();
    let mut aliases: Vec<String> = Vec::new();

    if let Some(caps) = WRITE_TARGET.captures(&text) {
        push_unique(&mut refs.tables, &caps[1]);
    }

    if let Some(caps) = FROM_CLAUSE.captures(&text) {
        for item in split_top_level(&caps[1]) {
            match PLAIN_IDENTIFIER.captures(item) {
                Some(ident) => {
                    push_unique(&mut refs.tables, &ident[1]);
                    if let Some(alias) = ident.get(2) {
                        aliases.push(alias.as_str().to_string());
                    }
                }
                None => return Err(format!("unrecognized FROM item '{}'", item)),
            }
        }
    }

    for caps in JOIN_TABLE.captures_iter(&text) {
        push_unique(&mut refs.tables, &caps[1]);
        if let Some(alias) = caps.get(2) {
            if !is_reserved(alias.as_str()) && !alias.as_str().eq_ignore_ascii_case("ON") {
                aliases.push(alias.as_str().to_string());
            }
        }
    }

    let mut select_aliases: Vec<String> = Vec::new();
    if let Some(caps) = SELECT_LIST.captures(&text) {
        for item in split_top_level(&caps[1]) {
            if item == "*" || item.ends_with(".*") {
                continue;
            }
            if let Some(ident) = PLAIN_IDENTIFIER.captures(item) {
                let column = unqualified(&ident[1]);
                if !is_reserved(column) {
                    push_unique(&mut refs.columns, column);
                }
                if let Some(alias) = ident.get(2) {
                    select_aliases.push(alias.as_str().to_string());
                }
            } else if let Some((_, alias)) = item.rsplit_once(" AS ").or_else(|| item.rsplit_once(" as ")) {
                // expressions are not checked, but their aliases may be used in ORDER BY
                select_aliases.push(alias.trim().to_string());
            }
        }
    }

    if let Some(caps) = WHERE_CLAUSE.captures(&text) {
        for ident in COMPARED_IDENTIFIER.captures_iter(&caps[1]) {
            let column = unqualified(&ident[1]);
            if !is_reserved(column) {
                push_unique(&mut refs.columns, column);
            }
        }
    }

    if let Some(caps) = ORDER_BY_CLAUSE.captures(&text) {
        for item in split_top_level(&caps[1]) {
            let name = item.split_whitespace().next().unwrap_or_default();
            if name.is_empty() || name.chars().all(|c| c.is_ascii_digit()) || name.contains('(') {
                continue;
            }
            let column = unqualified(name);
            let is_alias = select_aliases.iter().any(|a| a.eq_ignore_ascii_case(column));
            if !is_alias && !is_reserved(column) {
                push_unique(&mut refs.columns, column);
            }
        }
    }

    // Table aliases never name columns
    refs.columns
        .retain(|c| !aliases.iter().any(|a| a.eq_ignore_ascii_case(c)));

    Ok(refs)
}
