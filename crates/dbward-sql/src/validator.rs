use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

/// A resolved `(schema, table)` reference, extracted from `FROM`/`JOIN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub schema: String,
    pub table: String,
}

/// A resolved `ORDER BY` sort key: `schema.table.column` plus direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByKey {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MultiStatement,
    Comment,
    ForbiddenKeyword(&'static str),
    NotSelectFirst,
    ImplicitJoin,
    UnqualifiedTable,
    NoTablesExtracted,
    OrderByMultipleClauses,
    OrderByTooManySortKeys,
    OrderByMalformedKey,
    OrderByAmbiguousAlias,
    OrderByColumnNotAllowed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuery {
    pub tables: HashSet<QualifiedName>,
    pub order_by: Vec<OrderByKey>,
}

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "TRUNCATE", "DROP", "ALTER", "CREATE", "GRANT", "REVOKE",
    "MERGE", "CALL", "EXEC", "EXECUTE", "WITH", "UNION", "INTERSECT", "EXCEPT", "OFFSET", "INTO",
];

static FIRST_KEYWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*SELECT\b").unwrap());

static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--|/\*|\*/|#").unwrap());

static LOCKING_CLAUSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bFOR\s+(UPDATE|SHARE)\b").unwrap());

/// One compiled, word-boundary-anchored regex per entry in
/// `FORBIDDEN_KEYWORDS`, built once rather than recompiled on every
/// `validate` call.
static FORBIDDEN_KEYWORD_RES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    FORBIDDEN_KEYWORDS
        .iter()
        .map(|keyword| (*keyword, Regex::new(&format!(r"\b{keyword}\b")).unwrap()))
        .collect()
});

/// `LIMIT x, y` — the MySQL/SQLite offset-via-comma form. Rejected as an
/// `OFFSET` equivalent per spec: it carries no `OFFSET` token of its own,
/// so it must be caught structurally instead of by keyword match.
static LIMIT_COMMA_OFFSET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bLIMIT\s+\d+\s*,").unwrap());

static TABLE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*)(\.([A-Za-z_][A-Za-z0-9_]*))?(?:\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?",
    )
    .unwrap()
});

/// Captures the whole `FROM ... JOIN ...` region up to whichever clause
/// terminates it (or end of string). Any top-level comma in this region —
/// not just one immediately following the first table — signals an
/// implicit join, including the mixed explicit-then-implicit form where a
/// `JOIN` is followed by a bare comma-joined table.
static FROM_REGION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bFROM\b(.*?)(\bWHERE\b|\bGROUP\s+BY\b|\bORDER\s+BY\b|\bLIMIT\b|$)").unwrap()
});

static ORDER_BY_CLAUSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bORDER\s+BY\b").unwrap());

static ORDER_BY_EXTRACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bORDER\s+BY\b(.*?)(\bLIMIT\b|$)").unwrap()
});

static SORT_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z_][A-Za-z0-9_]*))?\s+(ASC|DESC)\s*$",
    )
    .unwrap()
});

/// Pure, regex-only structural validator. Rejects by default: any
/// ambiguity in extraction is a reject, not a best-effort accept. This is
/// deliberately not a SQL parser — see the module docs.
pub fn validate(
    sql: &str,
    orderby_allowlist: Option<&HashSet<(String, String, String)>>,
) -> Result<ValidatedQuery, ValidationError> {
    if sql.contains(';') {
        return Err(ValidationError::MultiStatement);
    }
    if COMMENT_RE.is_match(sql) {
        return Err(ValidationError::Comment);
    }
    if !FIRST_KEYWORD_RE.is_match(sql) {
        return Err(ValidationError::NotSelectFirst);
    }
    if LOCKING_CLAUSE_RE.is_match(sql) {
        return Err(ValidationError::ForbiddenKeyword("FOR UPDATE/SHARE"));
    }

    let upper = sql.to_uppercase();
    for (keyword, re) in FORBIDDEN_KEYWORD_RES.iter() {
        if re.is_match(&upper) {
            return Err(ValidationError::ForbiddenKeyword(keyword));
        }
    }
    if LIMIT_COMMA_OFFSET_RE.is_match(sql) {
        return Err(ValidationError::ForbiddenKeyword("OFFSET"));
    }

    let from_region = FROM_REGION_RE
        .captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or_default();
    if from_region.contains(',') {
        return Err(ValidationError::ImplicitJoin);
    }

    let (tables, alias_map) = extract_tables(sql)?;
    if tables.is_empty() {
        return Err(ValidationError::NoTablesExtracted);
    }

    let order_by = extract_order_by(sql, &alias_map, orderby_allowlist)?;

    Ok(ValidatedQuery { tables, order_by })
}

type AliasMap = HashMap<String, QualifiedName>;

fn extract_tables(sql: &str) -> Result<(HashSet<QualifiedName>, AliasMap), ValidationError> {
    let mut tables = HashSet::new();
    let mut aliases = AliasMap::new();

    for caps in TABLE_REF_RE.captures_iter(sql) {
        let first = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let second = caps.get(3).map(|m| m.as_str());
        let alias = caps.get(4).map(|m| m.as_str());

        let Some(table) = second else {
            // FROM/JOIN immediately followed by a bare identifier: unqualified.
            return Err(ValidationError::UnqualifiedTable);
        };

        let qname = QualifiedName {
            schema: first.to_string(),
            table: table.to_string(),
        };
        tables.insert(qname.clone());
        aliases.insert(table.to_string(), qname.clone());
        if let Some(alias) = alias {
            aliases.insert(alias.to_string(), qname);
        }
    }

    Ok((tables, aliases))
}

fn extract_order_by(
    sql: &str,
    aliases: &AliasMap,
    orderby_allowlist: Option<&HashSet<(String, String, String)>>,
) -> Result<Vec<OrderByKey>, ValidationError> {
    let clause_count = ORDER_BY_CLAUSE_RE.find_iter(sql).count();
    if clause_count == 0 {
        return Ok(Vec::new());
    }
    if clause_count > 1 {
        return Err(ValidationError::OrderByMultipleClauses);
    }

    let Some(allowlist) = orderby_allowlist else {
        return Err(ValidationError::OrderByColumnNotAllowed);
    };

    let body = ORDER_BY_EXTRACT_RE
        .captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or_default();

    let keys: Vec<&str> = body.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if keys.is_empty() || keys.len() > 2 {
        return Err(ValidationError::OrderByTooManySortKeys);
    }

    let mut resolved = Vec::with_capacity(keys.len());
    for key in keys {
        let caps = SORT_KEY_RE
            .captures(key)
            .ok_or(ValidationError::OrderByMalformedKey)?;
        let first = caps.get(1).unwrap().as_str();
        let second = caps.get(2).unwrap().as_str();
        let third = caps.get(3).map(|m| m.as_str());
        let direction = caps.get(4).unwrap().as_str();

        let (qname, column) = match third {
            // schema.table.column form.
            Some(column) => (
                QualifiedName {
                    schema: first.to_string(),
                    table: second.to_string(),
                },
                column.to_string(),
            ),
            // alias.column form — resolve through the alias map built from FROM/JOIN.
            None => {
                let qname = aliases
                    .get(first)
                    .cloned()
                    .ok_or(ValidationError::OrderByAmbiguousAlias)?;
                (qname, second.to_string())
            }
        };
        let triple = (qname.schema.clone(), qname.table.clone(), column.clone());
        if !allowlist.contains(&triple) {
            return Err(ValidationError::OrderByColumnNotAllowed);
        }

        resolved.push(OrderByKey {
            schema: qname.schema,
            table: qname.table,
            column,
            descending: direction.eq_ignore_ascii_case("DESC"),
        });
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orderby_allowlist() -> HashSet<(String, String, String)> {
        let mut s = HashSet::new();
        s.insert(("public".into(), "users".into(), "id".into()));
        s
    }

    #[test]
    fn happy_path_query_with_order_by() {
        let sql = "SELECT u.id FROM public.users u ORDER BY u.id ASC";
        let result = validate(sql, Some(&orderby_allowlist())).unwrap();
        assert_eq!(result.tables.len(), 1);
        assert_eq!(result.order_by.len(), 1);
        assert!(!result.order_by[0].descending);
    }

    #[test]
    fn rejects_multi_statement() {
        let sql = "SELECT * FROM public.users; DROP TABLE public.users";
        assert_eq!(validate(sql, None).unwrap_err(), ValidationError::MultiStatement);
    }

    #[test]
    fn rejects_unqualified_table() {
        let sql = "SELECT * FROM users";
        assert_eq!(validate(sql, None).unwrap_err(), ValidationError::UnqualifiedTable);
    }

    #[test]
    fn rejects_order_by_with_function() {
        let sql = "SELECT * FROM public.users u ORDER BY LOWER(u.name) ASC";
        assert_eq!(
            validate(sql, Some(&orderby_allowlist())).unwrap_err(),
            ValidationError::OrderByMalformedKey
        );
    }

    #[test]
    fn rejects_comments() {
        assert_eq!(
            validate("SELECT * FROM public.users -- drop it", None).unwrap_err(),
            ValidationError::Comment
        );
        assert_eq!(
            validate("SELECT * FROM public.users /* x */", None).unwrap_err(),
            ValidationError::Comment
        );
    }

    #[test]
    fn rejects_write_keyword_anywhere_in_the_text() {
        let sql = "SELECT * FROM public.users WHERE id = (DELETE FROM public.accounts)";
        let err = validate(sql, None).unwrap_err();
        assert_eq!(err, ValidationError::ForbiddenKeyword("DELETE"));
    }

    #[test]
    fn does_not_false_positive_on_identifiers_containing_keywords() {
        let sql = "SELECT update_flag FROM public.users";
        // `update_flag` must not trip the `UPDATE` word-boundary check.
        assert!(validate(sql, None).is_ok());
    }

    #[test]
    fn rejects_leading_cte_as_non_select_first_keyword() {
        let sql = "WITH x AS (SELECT 1) SELECT * FROM public.users";
        assert_eq!(validate(sql, None).unwrap_err(), ValidationError::NotSelectFirst);
    }

    #[test]
    fn rejects_cte_embedded_mid_query() {
        let sql = "SELECT * FROM public.users WHERE id IN (WITH x AS (SELECT 1) SELECT 1 FROM x)";
        assert_eq!(
            validate(sql, None).unwrap_err(),
            ValidationError::ForbiddenKeyword("WITH")
        );
    }

    #[test]
    fn rejects_offset() {
        let sql = "SELECT * FROM public.users LIMIT 10 OFFSET 5";
        assert_eq!(
            validate(sql, None).unwrap_err(),
            ValidationError::ForbiddenKeyword("OFFSET")
        );
    }

    #[test]
    fn rejects_locking_clause() {
        let sql = "SELECT * FROM public.users FOR UPDATE";
        assert_eq!(
            validate(sql, None).unwrap_err(),
            ValidationError::ForbiddenKeyword("FOR UPDATE/SHARE")
        );
    }

    #[test]
    fn rejects_implicit_join() {
        let sql = "SELECT * FROM public.users u, public.accounts a";
        assert_eq!(validate(sql, None).unwrap_err(), ValidationError::ImplicitJoin);
    }

    #[test]
    fn rejects_limit_offset_comma_form() {
        let sql = "SELECT u.id FROM public.users u LIMIT 10, 5";
        assert_eq!(
            validate(sql, None).unwrap_err(),
            ValidationError::ForbiddenKeyword("OFFSET")
        );
    }

    #[test]
    fn rejects_implicit_join_mixed_with_explicit_join() {
        let sql = "SELECT * FROM public.users u JOIN public.x ON u.id = public.x.id, public.z";
        assert_eq!(validate(sql, None).unwrap_err(), ValidationError::ImplicitJoin);
    }

    #[test]
    fn rejects_more_than_two_sort_keys() {
        let sql = "SELECT * FROM public.users u ORDER BY u.id ASC, u.name DESC, u.email ASC";
        assert_eq!(
            validate(sql, Some(&orderby_allowlist())).unwrap_err(),
            ValidationError::OrderByTooManySortKeys
        );
    }

    #[test]
    fn rejects_order_by_missing_direction() {
        let sql = "SELECT * FROM public.users u ORDER BY u.id";
        assert_eq!(
            validate(sql, Some(&orderby_allowlist())).unwrap_err(),
            ValidationError::OrderByMalformedKey
        );
    }

    #[test]
    fn rejects_order_by_without_allowlist_configured() {
        let sql = "SELECT * FROM public.users u ORDER BY u.id ASC";
        assert_eq!(
            validate(sql, None).unwrap_err(),
            ValidationError::OrderByColumnNotAllowed
        );
    }

    #[test]
    fn rejects_order_by_column_outside_allowlist() {
        let sql = "SELECT * FROM public.users u ORDER BY u.email ASC";
        assert_eq!(
            validate(sql, Some(&orderby_allowlist())).unwrap_err(),
            ValidationError::OrderByColumnNotAllowed
        );
    }

    #[test]
    fn over_extraction_is_safe_under_extraction_is_not() {
        // Zero tables extracted must fail closed even when SQL is otherwise shaped correctly.
        let sql = "SELECT 1";
        assert_eq!(
            validate(sql, None).unwrap_err(),
            ValidationError::NoTablesExtracted
        );
    }
}
