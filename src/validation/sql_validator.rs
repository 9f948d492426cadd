use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use crate::api::middleware::AppError;

/// Whether a statement reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

const PLACEHOLDER_MARK: char = '\u{0}';
const READ_KEYWORDS: [&str; 6] = ["SELECT", "WITH", "VALUES", "SHOW", "EXPLAIN", "DESCRIBE"];

/// SQL helpers for configured queries: placeholder accounting, statement
/// classification and pagination rewriting
pub struct SqlValidator;

impl SqlValidator {
    /// Count `?` placeholders, ignoring any inside string literals, quoted
    /// identifiers and comments
    pub fn count_placeholders(sql: &str) -> usize {
        let dialect = GenericDialect {};
        match Tokenizer::new(&dialect, sql).tokenize() {
            Ok(tokens) => tokens
                .iter()
                .filter(|t| matches!(t, Token::Placeholder(p) if p.starts_with('?')))
                .count(),
            Err(e) => {
                tracing::debug!("Tokenizer failed ({}), falling back to a text scan", e);
                Self::scan_placeholders(sql).1
            }
        }
    }

    /// Classify by the leading keyword
    pub fn statement_kind(sql: &str) -> StatementKind {
        let dialect = GenericDialect {};
        let leading = Tokenizer::new(&dialect, sql)
            .tokenize()
            .ok()
            .and_then(|tokens| {
                tokens.into_iter().find_map(|t| match t {
                    Token::Word(w) => Some(w.value.to_ascii_uppercase()),
                    Token::LParen => Some("(".to_string()),
                    _ => None,
                })
            })
            .unwrap_or_else(|| {
                sql.split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_ascii_uppercase()
            });

        if leading == "(" || READ_KEYWORDS.contains(&leading.as_str()) {
            StatementKind::Read
        } else {
            StatementKind::Write
        }
    }

    /// Parse the SQL as exactly one statement
    pub fn validate_single_statement(sql: &str) -> Result<StatementKind, AppError> {
        let dialect = GenericDialect {};
        let ast = Parser::parse_sql(&dialect, sql)
            .map_err(|e| AppError::Validation(format!("SQL parsing error: {}", e)))?;

        match ast.len() {
            0 => Err(AppError::Validation("Empty SQL query".to_string())),
            1 => Ok(match &ast[0] {
                Statement::Query(_) => StatementKind::Read,
                _ => Self::statement_kind(sql),
            }),
            n => Err(AppError::Validation(format!(
                "Expected a single statement, found {}",
                n
            ))),
        }
    }

    /// Append a `LIMIT ? OFFSET ?` pair. A query that already carries its own
    /// LIMIT is wrapped in a sub-select so the page applies to its result.
    pub fn paginate(sql: &str) -> String {
        let trimmed = sql.trim().trim_end_matches(';').trim_end();
        if Self::has_limit(trimmed) {
            format!("SELECT * FROM ({}) AS paged_result LIMIT ? OFFSET ?", trimmed)
        } else {
            format!("{} LIMIT ? OFFSET ?", trimmed)
        }
    }

    /// Rewrite `?` placeholders as `$1..$n` (PostgreSQL style)
    pub fn numbered_placeholders(sql: &str) -> String {
        let (marked, _) = Self::scan_placeholders(sql);
        let mut out = String::with_capacity(marked.len() + 8);
        for (idx, piece) in marked.split(PLACEHOLDER_MARK).enumerate() {
            if idx > 0 {
                out.push('$');
                out.push_str(&idx.to_string());
            }
            out.push_str(piece);
        }
        out
    }

    /// Walk the SQL, replacing every `?` outside quotes and comments with a
    /// marker character. Returns the marked text and the placeholder count.
    fn scan_placeholders(sql: &str) -> (String, usize) {
        #[derive(PartialEq)]
        enum State {
            Code,
            Single,
            Double,
            Backtick,
            LineComment,
            BlockComment,
        }

        let mut state = State::Code;
        let mut out = String::with_capacity(sql.len());
        let mut count = 0;
        let mut chars = sql.chars().peekable();

        while let Some(c) = chars.next() {
            match state {
                State::Code => match c {
                    '\'' => state = State::Single,
                    '"' => state = State::Double,
                    '`' => state = State::Backtick,
                    '-' if chars.peek() == Some(&'-') => state = State::LineComment,
                    '/' if chars.peek() == Some(&'*') => {
                        out.push(c);
                        if let Some(star) = chars.next() {
                            out.push(star);
                        }
                        state = State::BlockComment;
                        continue;
                    }
                    '?' => {
                        count += 1;
                        out.push(PLACEHOLDER_MARK);
                        continue;
                    }
                    _ => {}
                },
                State::Single if c == '\'' => state = State::Code,
                State::Double if c == '"' => state = State::Code,
                State::Backtick if c == '`' => state = State::Code,
                State::LineComment if c == '\n' => state = State::Code,
                State::BlockComment if c == '*' && chars.peek() == Some(&'/') => {
                    out.push(c);
                    if let Some(slash) = chars.next() {
                        out.push(slash);
                    }
                    state = State::Code;
                    continue;
                }
                _ => {}
            }
            out.push(c);
        }

        (out, count)
    }

    /// Check if a statement has a LIMIT clause using AST analysis
    fn check_limit_in_statement(stmt: &Statement) -> bool {
        match stmt {
            Statement::Query(query) => query.limit_clause.is_some(),
            _ => false,
        }
    }

    /// Check if SQL has LIMIT clause using AST parsing
    fn has_limit(sql: &str) -> bool {
        let dialect = GenericDialect {};
        match Parser::parse_sql(&dialect, sql) {
            Ok(ast) => ast.first().map(Self::check_limit_in_statement).unwrap_or(false),
            Err(_) => false,
        }
    }
}
