use std::collections::{HashMap, HashSet};

use crate::validator::QualifiedName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowlistError {
    UnauthorizedTable,
}

/// Configured set of permitted `(schema, table)` pairs. A pure predicate,
/// immutable after startup. Enforcement is a step distinct from structural
/// validation: a structurally valid query can still name a table the
/// caller has no allowlist entry for.
#[derive(Debug, Clone)]
pub struct Allowlist {
    schemas: HashSet<String>,
    tables: Option<HashMap<String, HashSet<String>>>,
}

impl Allowlist {
    pub fn new(schemas: HashSet<String>, tables: Option<HashMap<String, HashSet<String>>>) -> Self {
        Allowlist { schemas, tables }
    }

    /// Schema-only check, used by tools that accept a caller-supplied
    /// schema filter (e.g. `list_tables`) before handing it to the adapter.
    pub fn schema_allowed(&self, schema: &str) -> bool {
        self.schemas.contains(schema)
    }

    pub fn check(&self, name: &QualifiedName) -> Result<(), AllowlistError> {
        if !self.schemas.contains(&name.schema) {
            return Err(AllowlistError::UnauthorizedTable);
        }
        if let Some(tables) = &self.tables
            && let Some(allowed_tables) = tables.get(&name.schema)
            && !allowed_tables.contains(&name.table)
        {
            return Err(AllowlistError::UnauthorizedTable);
        }
        Ok(())
    }

    pub fn check_all<'a>(
        &self,
        names: impl IntoIterator<Item = &'a QualifiedName>,
    ) -> Result<(), AllowlistError> {
        for name in names {
            self.check(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(schema: &str, table: &str) -> QualifiedName {
        QualifiedName {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    #[test]
    fn rejects_schema_not_in_allowlist() {
        let allow = Allowlist::new(HashSet::from(["public".to_string()]), None);
        assert_eq!(
            allow.check(&name("other", "users")).unwrap_err(),
            AllowlistError::UnauthorizedTable
        );
    }

    #[test]
    fn schema_only_allowlist_permits_any_table_in_schema() {
        let allow = Allowlist::new(HashSet::from(["public".to_string()]), None);
        assert!(allow.check(&name("public", "anything")).is_ok());
    }

    #[test]
    fn per_schema_table_allowlist_is_enforced() {
        let mut tables = HashMap::new();
        tables.insert("public".to_string(), HashSet::from(["users".to_string()]));
        let allow = Allowlist::new(HashSet::from(["public".to_string()]), Some(tables));
        assert!(allow.check(&name("public", "users")).is_ok());
        assert_eq!(
            allow.check(&name("public", "admins")).unwrap_err(),
            AllowlistError::UnauthorizedTable
        );
    }
}
