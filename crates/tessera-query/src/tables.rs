//! Table extraction for native statements.
//!
//! Native SQL is never parsed; these helpers only recognise the table names
//! that follow `FROM`, `JOIN`, `UPDATE`, `INTO` and `DELETE FROM`. They are
//! used to decide whether pending writes must be flushed before a query and
//! which cached collections a bulk statement invalidates.

use regex::Regex;
use std::sync::OnceLock;
use tessera_core::{Error, Result};

// One identifier (double-quoted, backquoted or bare), optionally schema-qualified.
const IDENT: &str = concat!(
    r#"((?:"(?:[^"]|"")+"|`[^`]+`|[A-Za-z_][A-Za-z0-9_$]*)"#,
    r#"(?:\.(?:"(?:[^"]|"")+"|`[^`]+`|[A-Za-z_][A-Za-z0-9_$]*))?)"#,
);

type Pattern = OnceLock<std::result::Result<Regex, regex::Error>>;

fn compile(cell: &'static Pattern, pattern: impl FnOnce() -> String) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(&pattern()))
        .as_ref()
        .map_err(|e| Error::Custom(format!("invalid table pattern: {e}")))
}

fn referenced_regex() -> Result<&'static Regex> {
    static REFERENCED: Pattern = OnceLock::new();
    compile(&REFERENCED, || format!(r"(?i)\b(?:from|join|update|into)\s+{IDENT}"))
}

fn modified_regex() -> Result<&'static Regex> {
    static MODIFIED: Pattern = OnceLock::new();
    compile(&MODIFIED, || {
        format!(r"(?i)^\s*(?:update|delete\s+from|insert\s+into)\s+{IDENT}")
    })
}

/// Strip quoting and any schema prefix: `"public"."books"` and `public.books` both become `books`.
fn normalize(raw: &str) -> String {
    let last = raw.rsplit('.').next().unwrap_or(raw);
    let trimmed = last.trim_matches(|c| c == '"' || c == '`');
    trimmed.replace("\"\"", "\"")
}

/// Tables a statement reads or writes, in order of first appearance.
pub fn referenced_tables(sql: &str) -> Result<Vec<String>> {
    let regex = referenced_regex()?;
    let mut tables: Vec<String> = Vec::new();
    for caps in regex.captures_iter(sql) {
        let Some(name) = caps.get(1) else { continue };
        let table = normalize(name.as_str());
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    Ok(tables)
}

/// Target table of an INSERT, UPDATE or DELETE statement.
pub fn modified_table(sql: &str) -> Result<Option<String>> {
    let regex = modified_regex()?;
    Ok(regex
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| normalize(m.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_with_join() {
        let tables = referenced_tables(
            "SELECT b.* FROM books b JOIN \"authors\" a ON a.id = b.author_id LEFT JOIN \"public\".\"tags\" t ON 1 = 1",
        )
        .unwrap();
        assert_eq!(tables, vec!["books", "authors", "tags"]);
    }

    #[test]
    fn dml_targets() {
        assert_eq!(
            modified_table("UPDATE books SET title = ?").unwrap().as_deref(),
            Some("books")
        );
        assert_eq!(
            modified_table("delete from \"book_tags\" where book_id = ?")
                .unwrap()
                .as_deref(),
            Some("book_tags")
        );
        assert_eq!(
            modified_table("  INSERT INTO `authors` (name) VALUES (?)")
                .unwrap()
                .as_deref(),
            Some("authors")
        );
        assert_eq!(modified_table("SELECT * FROM books").unwrap(), None);
    }

    #[test]
    fn no_tables() {
        assert!(referenced_tables("SELECT 1").unwrap().is_empty());
    }
}
