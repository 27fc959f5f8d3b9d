//! SQL statement splitting.
//!
//! Migration files may contain any number of statements separated by `;`.
//! Drivers are handed one statement at a time, so the splitter must know
//! enough SQL lexical structure not to split inside string literals,
//! comments or dollar-quoted blocks.

/// Splits SQL source into individual statements.
///
/// The scanner understands single- and double-quoted literals (with doubled
/// quotes as escapes), `--` line comments, non-nesting `/* ... */` block
/// comments and PostgreSQL dollar-quoted strings (`$tag$ ... $tag$`).
/// Terminating semicolons are dropped, and statements containing nothing
/// but whitespace and comments are discarded.
#[must_use]
pub fn split_statements(input: &str) -> Vec<String> {
    Splitter::new(input).run()
}

struct Splitter<'a> {
    input: &'a str,
    pos: usize,
    /// Start of the statement currently being scanned.
    start: usize,
    /// Whether the current statement has any content outside comments.
    has_content: bool,
    statements: Vec<String>,
}

impl<'a> Splitter<'a> {
    const fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            start: 0,
            has_content: false,
            statements: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.input[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn run(mut self) -> Vec<String> {
        while let Some(c) = self.peek() {
            match c {
                ';' => {
                    self.end_statement();
                    self.advance();
                    self.start = self.pos;
                    self.has_content = false;
                }
                '\'' | '"' => {
                    self.has_content = true;
                    self.scan_quoted(c);
                }
                '-' if self.peek_next() == Some('-') => self.scan_line_comment(),
                '/' if self.peek_next() == Some('*') => self.scan_block_comment(),
                '$' => {
                    if !self.try_scan_dollar_quote() {
                        self.has_content = true;
                        self.advance();
                    }
                }
                _ => {
                    if !c.is_whitespace() {
                        self.has_content = true;
                    }
                    self.advance();
                }
            }
        }
        self.end_statement();
        self.statements
    }

    fn end_statement(&mut self) {
        if self.has_content {
            let stmt = self.input[self.start..self.pos].trim();
            if !stmt.is_empty() {
                self.statements.push(stmt.to_string());
            }
        }
    }

    /// Scans past a quoted literal. A doubled quote is an escape, not a
    /// terminator. An unterminated literal runs to end of input.
    fn scan_quoted(&mut self, quote: char) {
        self.advance();
        while let Some(c) = self.advance() {
            if c == quote {
                if self.peek() == Some(quote) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
    }

    fn scan_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn scan_block_comment(&mut self) {
        self.advance();
        self.advance();
        loop {
            match self.advance() {
                Some('*') if self.peek() == Some('/') => {
                    self.advance();
                    break;
                }
                None => break,
                _ => {}
            }
        }
    }

    /// Attempts to scan a dollar-quoted string starting at the current `$`.
    ///
    /// Returns false (without consuming anything) when the `$` does not
    /// open a valid `$tag$` delimiter, e.g. a `$1` parameter placeholder.
    fn try_scan_dollar_quote(&mut self) -> bool {
        let rest = &self.input[self.pos..];
        let Some(tag_len) = dollar_tag_len(rest) else {
            return false;
        };
        let delimiter = &rest[..tag_len];

        self.has_content = true;
        self.pos += tag_len;
        match self.input[self.pos..].find(delimiter) {
            Some(offset) => self.pos += offset + delimiter.len(),
            // Unterminated: consume to end of input.
            None => self.pos = self.input.len(),
        }
        true
    }
}

/// Returns the byte length of a `$tag$` delimiter at the start of `s`,
/// including both dollar signs, or `None` if `s` does not start with one.
/// Tags follow identifier rules, so `$1` (a parameter placeholder) does not
/// open a delimiter.
fn dollar_tag_len(s: &str) -> Option<usize> {
    let mut chars = s.char_indices();
    let (_, '$') = chars.next()? else {
        return None;
    };
    let mut first = true;
    for (idx, c) in chars {
        match c {
            '$' => return Some(idx + 1),
            c if c.is_alphabetic() || c == '_' => {}
            c if c.is_numeric() && !first => {}
            _ => return None,
        }
        first = false;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_statement() {
        assert_eq!(
            split_statements("CREATE TABLE t (id INT)"),
            vec!["CREATE TABLE t (id INT)"]
        );
    }

    #[test]
    fn test_multiple_statements() {
        let sql = "CREATE TABLE a (id INT);\nCREATE TABLE b (id INT);";
        assert_eq!(
            split_statements(sql),
            vec!["CREATE TABLE a (id INT)", "CREATE TABLE b (id INT)"]
        );
    }

    #[test]
    fn test_semicolon_in_string_literal() {
        let sql = "INSERT INTO t VALUES ('a;b');INSERT INTO t VALUES (1)";
        assert_eq!(
            split_statements(sql),
            vec!["INSERT INTO t VALUES ('a;b')", "INSERT INTO t VALUES (1)"]
        );
    }

    #[test]
    fn test_escaped_quote() {
        let sql = "INSERT INTO t VALUES ('it''s;fine');SELECT 1";
        assert_eq!(
            split_statements(sql),
            vec!["INSERT INTO t VALUES ('it''s;fine')", "SELECT 1"]
        );
    }

    #[test]
    fn test_double_quoted_identifier() {
        let sql = r#"SELECT ";" FROM "weird;name";SELECT 2"#;
        assert_eq!(
            split_statements(sql),
            vec![r#"SELECT ";" FROM "weird;name""#, "SELECT 2"]
        );
    }

    #[test]
    fn test_line_comment() {
        let sql = "SELECT 1; -- trailing; comment\nSELECT 2";
        assert_eq!(split_statements(sql), vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_block_comment() {
        let sql = "SELECT 1 /* not a ; terminator */;SELECT 2";
        assert_eq!(
            split_statements(sql),
            vec!["SELECT 1 /* not a ; terminator */", "SELECT 2"]
        );
    }

    #[test]
    fn test_dollar_quoted_body() {
        let sql = "CREATE FUNCTION f() RETURNS void AS $$ BEGIN; END; $$ LANGUAGE plpgsql;SELECT 1";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("BEGIN; END;"));
        assert_eq!(statements[1], "SELECT 1");
    }

    #[test]
    fn test_tagged_dollar_quote() {
        let sql = "SELECT $tag$; '\" $$ ;$tag$;SELECT 2";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1], "SELECT 2");
    }

    #[test]
    fn test_dollar_parameter_is_not_a_quote() {
        let sql = "SELECT * FROM t WHERE id = $1;SELECT 2";
        assert_eq!(
            split_statements(sql),
            vec!["SELECT * FROM t WHERE id = $1", "SELECT 2"]
        );
    }

    #[test]
    fn test_empty_statements_discarded() {
        assert_eq!(split_statements(";;  ;"), Vec::<String>::new());
        assert_eq!(split_statements(""), Vec::<String>::new());
    }

    #[test]
    fn test_comment_only_statement_discarded() {
        let sql = "-- nothing here\n;SELECT 1";
        assert_eq!(split_statements(sql), vec!["SELECT 1"]);
    }

    #[test]
    fn test_directive_comment_kept_with_statement() {
        let sql = "-- depends: 0001\nCREATE TABLE t (id INT);";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 1);
        assert!(statements[0].starts_with("-- depends: 0001"));
    }

    #[test]
    fn test_no_trailing_semicolon() {
        let sql = "SELECT 1;\nSELECT 2";
        assert_eq!(split_statements(sql), vec!["SELECT 1", "SELECT 2"]);
    }
}
