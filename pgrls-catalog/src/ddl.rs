//! DDL text for row level security objects
//!
//! Table and policy names are validated identifiers and are always
//! double-quoted. Expressions come from the policy compiler and are placed
//! inside parentheses unchanged.

use std::fmt;

use pgrls_common::Ident;
use pgrls_policy::CompiledPolicy;

/// Row level security switches on a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableAction {
    Enable,
    Disable,
    Force,
    NoForce,
}

impl TableAction {
    #[must_use]
    pub fn sql(self) -> &'static str {
        match self {
            Self::Enable => "ENABLE",
            Self::Disable => "DISABLE",
            Self::Force => "FORCE",
            Self::NoForce => "NO FORCE",
        }
    }
}

impl fmt::Display for TableAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// `ALTER TABLE "<t>" <action> ROW LEVEL SECURITY`
#[must_use]
pub fn alter_table(table: &Ident, action: TableAction) -> String {
    format!("ALTER TABLE {} {action} ROW LEVEL SECURITY", table.quoted())
}

/// Role list for a `TO` clause
///
/// `public` is a keyword here, not a role name, so it stays bare.
#[must_use]
pub fn role_list(roles: &[Ident]) -> String {
    if roles.is_empty() {
        return "public".to_string();
    }
    roles
        .iter()
        .map(|role| {
            if role.as_str().eq_ignore_ascii_case("public") {
                "public".to_string()
            } else {
                role.quoted()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn clauses(sql: &mut String, policy: &CompiledPolicy) {
    if let Some(using) = &policy.using {
        sql.push_str(" USING (");
        sql.push_str(using);
        sql.push(')');
    }
    if let Some(check) = &policy.check {
        sql.push_str(" WITH CHECK (");
        sql.push_str(check);
        sql.push(')');
    }
}

/// `CREATE POLICY ... AS {PERMISSIVE|RESTRICTIVE} FOR <cmd> TO <roles> ...`
#[must_use]
pub fn create_policy(policy: &CompiledPolicy) -> String {
    let mut sql = format!(
        "CREATE POLICY {} ON {} AS {} FOR {} TO {}",
        policy.name.quoted(),
        policy.table.quoted(),
        if policy.permissive { "PERMISSIVE" } else { "RESTRICTIVE" },
        policy.command.sql(),
        role_list(&policy.roles),
    );
    clauses(&mut sql, policy);
    sql
}

/// `ALTER POLICY ... [TO <roles>] [USING (..)] [WITH CHECK (..)]`
///
/// Command and permissiveness cannot be altered in place.
#[must_use]
pub fn alter_policy(policy: &CompiledPolicy, with_roles: bool) -> String {
    let mut sql = format!(
        "ALTER POLICY {} ON {}",
        policy.name.quoted(),
        policy.table.quoted()
    );
    if with_roles {
        sql.push_str(" TO ");
        sql.push_str(&role_list(&policy.roles));
    }
    clauses(&mut sql, policy);
    sql
}

/// `DROP POLICY IF EXISTS "<n>" ON "<t>"`
#[must_use]
pub fn drop_policy(table: &Ident, name: &Ident) -> String {
    format!("DROP POLICY IF EXISTS {} ON {}", name.quoted(), table.quoted())
}

/// Canonical form of an expression for change detection
///
/// Evens out what `pg_get_expr` changes when it deparses a stored policy:
/// whitespace, identifier quoting, `::text` casts on string literals and
/// parentheses wrapping the whole expression. String literals are kept
/// verbatim. Any other deparse difference reads as drift and costs one
/// `ALTER POLICY` that leaves the policy as declared.
#[must_use]
pub fn normalize_expr(expr: &str) -> String {
    let mut normalized = canonical_text(expr);
    while let Some(inner) = strip_outer_parens(&normalized) {
        normalized = inner.trim().to_string();
    }
    normalized
}

fn canonical_text(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut chars = expr.chars().peekable();
    let mut space = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                if space && !out.is_empty() && !out.ends_with('(') {
                    out.push(' ');
                }
                space = false;
                out.push(c);
                // `''` inside a literal shows up as two adjacent literals
                for l in chars.by_ref() {
                    out.push(l);
                    if l == '\'' {
                        break;
                    }
                }
                let rest: String = chars.clone().take(7).collect();
                if rest.starts_with("::text")
                    && !rest[6..].starts_with(|n: char| n.is_alphanumeric() || n == '_')
                {
                    for _ in 0..6 {
                        chars.next();
                    }
                }
            }
            '"' => {}
            c if c.is_whitespace() => space = true,
            ')' => {
                space = false;
                out.push(c);
            }
            _ => {
                if space && !out.is_empty() && !out.ends_with('(') {
                    out.push(' ');
                }
                space = false;
                out.push(c);
            }
        }
    }
    out
}

fn strip_outer_parens(expr: &str) -> Option<&str> {
    let inner = expr.strip_prefix('(')?.strip_suffix(')')?;
    let mut depth = 0_i32;
    let mut quoted = false;
    for c in inner.chars() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth -= 1;
                // `(a) AND (b)`: the first paren closes before the end
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then_some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgrls_policy::Command;
    use rstest::rstest;

    fn ident(name: &str) -> Ident {
        Ident::new(name).unwrap()
    }

    fn compiled(command: Command, using: Option<&str>, check: Option<&str>) -> CompiledPolicy {
        CompiledPolicy {
            name: ident("owner_policy"),
            table: ident("documents"),
            command,
            permissive: true,
            roles: vec![ident("public")],
            using: using.map(str::to_string),
            check: check.map(str::to_string),
        }
    }

    #[rstest]
    #[case(TableAction::Enable, "ALTER TABLE \"documents\" ENABLE ROW LEVEL SECURITY")]
    #[case(TableAction::Disable, "ALTER TABLE \"documents\" DISABLE ROW LEVEL SECURITY")]
    #[case(TableAction::Force, "ALTER TABLE \"documents\" FORCE ROW LEVEL SECURITY")]
    #[case(TableAction::NoForce, "ALTER TABLE \"documents\" NO FORCE ROW LEVEL SECURITY")]
    fn test_alter_table(#[case] action: TableAction, #[case] expected: &str) {
        assert_eq!(alter_table(&ident("documents"), action), expected);
    }

    #[test]
    fn test_create_policy() {
        let policy = compiled(Command::Select, Some("\"owner_id\" = 1"), None);
        assert_eq!(
            create_policy(&policy),
            "CREATE POLICY \"owner_policy\" ON \"documents\" AS PERMISSIVE FOR SELECT TO public USING (\"owner_id\" = 1)"
        );
    }

    #[test]
    fn test_create_restrictive_insert_with_roles() {
        let mut policy = compiled(Command::Insert, None, Some("x"));
        policy.permissive = false;
        policy.roles = vec![ident("app_user"), ident("auditor")];
        assert_eq!(
            create_policy(&policy),
            "CREATE POLICY \"owner_policy\" ON \"documents\" AS RESTRICTIVE FOR INSERT TO \"app_user\", \"auditor\" WITH CHECK (x)"
        );
    }

    #[test]
    fn test_alter_and_drop() {
        let policy = compiled(Command::All, Some("a"), Some("b"));
        assert_eq!(
            alter_policy(&policy, false),
            "ALTER POLICY \"owner_policy\" ON \"documents\" USING (a) WITH CHECK (b)"
        );
        assert_eq!(
            alter_policy(&policy, true),
            "ALTER POLICY \"owner_policy\" ON \"documents\" TO public USING (a) WITH CHECK (b)"
        );
        assert_eq!(
            drop_policy(&ident("documents"), &ident("owner_policy")),
            "DROP POLICY IF EXISTS \"owner_policy\" ON \"documents\""
        );
    }

    #[rstest]
    #[case("(a = b)", "a = b")]
    #[case("((a   =\n b))", "a = b")]
    #[case("(a) AND (b)", "(a) AND (b)")]
    #[case("(x = ')(')", "x = ')('")]
    #[case("", "")]
    #[case("( a = b )", "a = b")]
    #[case("(\"title\" = 'say \"hi\"')", "title = 'say \"hi\"'")]
    #[case("(name = 'it''s'::text)", "name = 'it''s'")]
    #[case("(name = 'x'::texts)", "name = 'x'::texts")]
    #[case(
        "(owner_id = (NULLIF(current_setting('rls.user_id'::text, true), ''::text))::integer)",
        "owner_id = (NULLIF(current_setting('rls.user_id', true), ''))::integer"
    )]
    fn test_normalize_expr(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_expr(input), expected);
    }

    #[test]
    fn test_normalize_expr_matches_catalog_deparse() {
        let compiled = "\"owner_id\" = NULLIF(current_setting('rls.user_id', true), '')::integer";
        let deparsed =
            "(owner_id = NULLIF(current_setting('rls.user_id'::text, true), ''::text)::integer)";
        assert_eq!(normalize_expr(compiled), normalize_expr(deparsed));
    }
}
