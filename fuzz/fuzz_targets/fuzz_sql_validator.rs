#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|sql: &str| {
    // Pure function, no ambient state — the only contract under fuzz is
    // "never panics, and a rejection never claims a non-empty table set".
    let orderby_allowlist = std::collections::HashSet::from([(
        "public".to_string(),
        "users".to_string(),
        "id".to_string(),
    )]);
    if let Ok(validated) = dbward_sql::validate(sql, Some(&orderby_allowlist)) {
        assert!(
            !validated.tables.is_empty(),
            "validator accepted a query with zero extracted tables"
        );
    }
});
