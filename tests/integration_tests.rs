//! End-to-end tests: declarations, compiled DDL, context propagation and
//! offline evaluation working together

use pgrls::catalog::CatalogManager;
use pgrls::common::memory::{MemorySession, MemorySessionError};
use pgrls::common::{Error, PolicyError, RlsConfig, Session, SqlValue};
use pgrls::context::{ContextKey, ContextStore, Principal};
use pgrls::policy::{
    parse_declarations, Command, ContextSnapshot, Dataset, EntityDefinition, Policy, Predicate,
};
use pgrls::RowSecurity;
use rstest::rstest;
use serde_json::{json, Value};

fn snapshot<S: Session>(session: &mut S) -> Result<ContextSnapshot, S::Error> {
    let store = ContextStore::default();
    let mut context = ContextSnapshot::new();
    for key in [ContextKey::user_id(), ContextKey::tenant_id()] {
        if let Some(value) = store.get(session, &key)? {
            context.insert(key.to_string(), value);
        }
    }
    Ok(context)
}

fn documents() -> Vec<Value> {
    vec![
        json!({ "id": 1, "tenant_id": 1, "owner_id": 10, "company_id": 1, "is_public": false }),
        json!({ "id": 2, "tenant_id": 2, "owner_id": 20, "company_id": 1, "is_public": false }),
    ]
}

fn visible_ids(rls: &RowSecurity, rows: &[Value], context: &ContextSnapshot, data: &Dataset) -> Vec<i64> {
    rls.evaluator()
        .visible_rows("Document", rows, context, data)
        .unwrap()
        .into_iter()
        .filter_map(|row| row["id"].as_i64())
        .collect()
}

#[test]
fn test_two_tenants_see_only_their_rows() {
    let rls = RowSecurity::new(RlsConfig::default()).unwrap();
    rls.register(
        EntityDefinition::new("Document", "documents")
            .unwrap()
            .policy(Policy::tenant("tenant_policy", "tenant_id").unwrap())
            .unwrap(),
    )
    .unwrap();
    let rows = documents();
    let data = Dataset::new();
    let mut session = MemorySession::new();

    for tenant in [1, 2] {
        let principal = Principal::anonymous().with_tenant(tenant.to_string());
        let ids: Result<Vec<i64>, MemorySessionError> = rls.run(&mut session, &principal, |s| {
            let context = snapshot(s)?;
            Ok(visible_ids(&rls, &rows, &context, &data))
        });
        assert_eq!(ids.unwrap(), vec![tenant], "tenant {tenant}");
    }

    // Context cleared at egress: nothing is visible any more
    assert_eq!(session.setting("rls.tenant_id").as_deref(), Some(""));
    let context = snapshot(&mut session).unwrap();
    assert!(visible_ids(&rls, &rows, &context, &data).is_empty());
}

#[test]
fn test_permissive_policies_combine_with_or() {
    let rls = RowSecurity::new(RlsConfig::default()).unwrap();
    rls.register(
        EntityDefinition::new("Document", "documents")
            .unwrap()
            .policy(Policy::user("owner", "owner_id").unwrap())
            .unwrap()
            .policy(Policy::tenant("tenant", "tenant_id").unwrap())
            .unwrap()
            .policy(Policy::custom("public", "is_public = true").unwrap())
            .unwrap(),
    )
    .unwrap();

    let rows = vec![
        json!({ "id": 1, "owner_id": 5, "tenant_id": 9, "is_public": false }),
        json!({ "id": 2, "owner_id": 6, "tenant_id": 1, "is_public": false }),
        json!({ "id": 3, "owner_id": 6, "tenant_id": 9, "is_public": true }),
        json!({ "id": 4, "owner_id": 6, "tenant_id": 9, "is_public": false }),
    ];
    let context = ContextSnapshot::from([
        ("user_id".to_string(), "5".to_string()),
        ("tenant_id".to_string(), "1".to_string()),
    ]);

    assert_eq!(visible_ids(&rls, &rows, &context, &Dataset::new()), vec![1, 2, 3]);
}

#[test]
fn test_restrictive_policy_narrows_reads_and_writes() {
    let rls = RowSecurity::new(RlsConfig::default()).unwrap();
    rls.register(EntityDefinition::new("Company", "companies").unwrap())
        .unwrap();
    rls.register(
        EntityDefinition::new("Document", "documents")
            .unwrap()
            .relation("company", "company_id", "companies")
            .unwrap()
            .policy(Policy::tenant("tenant", "tenant_id").unwrap())
            .unwrap()
            .policy(
                Policy::new("acme_only", Predicate::field_eq("company.name", "Acme").unwrap())
                    .unwrap()
                    .restrictive(),
            )
            .unwrap(),
    )
    .unwrap();

    let data = Dataset::new().with_table(
        "companies",
        vec![json!({ "id": 1, "name": "Acme" }), json!({ "id": 2, "name": "Globex" })],
    );
    let rows = vec![
        json!({ "id": 1, "tenant_id": 1, "company_id": 1 }),
        json!({ "id": 2, "tenant_id": 1, "company_id": 2 }),
    ];
    let context = ContextSnapshot::from([("tenant_id".to_string(), "1".to_string())]);

    assert_eq!(visible_ids(&rls, &rows, &context, &data), vec![1]);

    let insert = json!({ "id": 3, "tenant_id": 1, "company_id": 2 });
    assert!(!rls
        .evaluator()
        .can_write("Document", Command::Insert, &insert, &context, &data)
        .unwrap());

    let compiled = rls.compile().unwrap();
    let acme = compiled.iter().find(|p| p.name.as_str() == "acme_only").unwrap();
    assert!(!acme.permissive);
    let using = acme.using.as_deref().unwrap();
    assert_eq!(
        using,
        "\"company_id\" IN (SELECT \"id\" FROM \"companies\" WHERE \"name\" = 'Acme')"
    );
    assert!(!using.contains("FROM \"documents\", \"companies\""));
}

#[test]
fn test_update_of_foreign_row_is_silent_noop() {
    let rls = RowSecurity::new(RlsConfig::default()).unwrap();
    rls.register(
        EntityDefinition::new("Document", "documents")
            .unwrap()
            .policy(Policy::user("owner", "owner_id").unwrap())
            .unwrap(),
    )
    .unwrap();
    let rows = documents();
    let context = ContextSnapshot::from([("user_id".to_string(), "10".to_string())]);

    // UPDATE documents SET ... WHERE id = 2: the row is filtered by USING
    let affected = rows
        .iter()
        .filter(|row| row["id"] == 2)
        .filter(|row| {
            rls.evaluator()
                .can_read("Document", Command::Update, row, &context, &Dataset::new())
                .unwrap()
        })
        .count();
    assert_eq!(affected, 0);
}

#[test]
fn test_anonymous_principal_sets_no_user_id() {
    let rls = RowSecurity::new(RlsConfig::default()).unwrap();
    let mut session = MemorySession::new();

    let result: Result<(), MemorySessionError> =
        rls.run(&mut session, &Principal::anonymous(), |_| Ok(()));
    result.unwrap();

    assert!(!session
        .set_config_calls()
        .iter()
        .any(|call| call.params.first() == Some(&SqlValue::from("rls.user_id"))));
}

#[test]
fn test_hostile_values_stay_literals() {
    let entity = EntityDefinition::new("Document", "documents")
        .unwrap()
        .policy(
            Policy::new(
                "title_policy",
                Predicate::field_eq("title", "x'; DROP TABLE documents; --").unwrap(),
            )
            .unwrap(),
        )
        .unwrap();
    let rls = RowSecurity::new(RlsConfig::default()).unwrap();
    rls.register(entity).unwrap();

    let compiled = rls.compile().unwrap();
    assert_eq!(
        compiled[0].using.as_deref(),
        Some("\"title\" = 'x''; DROP TABLE documents; --'")
    );

    let err = Policy::tenant("p", "tenant_id; DROP TABLE documents").unwrap_err();
    assert!(matches!(err, PolicyError::InvalidIdentifier(_)));

    let mut session = MemorySession::new();
    let hostile = "1' OR '1'='1";
    let result: Result<(), MemorySessionError> = rls.run(
        &mut session,
        &Principal::authenticated(hostile),
        |_| Ok(()),
    );
    result.unwrap();
    for call in session.set_config_calls() {
        assert!(!call.sql.contains(hostile));
    }
}

#[test]
fn test_reconcile_is_idempotent() {
    let rls = RowSecurity::new(RlsConfig::default()).unwrap();
    for entity in parse_declarations(include_str!("../demos/policies.toml")).unwrap() {
        rls.register(entity).unwrap();
    }
    let compiled = rls.compile().unwrap();

    let mut first = MemorySession::new();
    let reports = rls.migrate(&mut first).unwrap();
    assert_eq!(reports.iter().map(|r| r.created.len()).sum::<usize>(), compiled.len());

    // Second run against a catalog holding exactly what was created
    let mut second = MemorySession::new();
    let catalog_rows = compiled
        .iter()
        .filter(|p| p.table.as_str() == "documents")
        .map(|p| {
            vec![
                SqlValue::from(p.name.as_str()),
                SqlValue::from(p.command.catalog_char().to_string()),
                SqlValue::from(p.permissive),
                SqlValue::from(p.using.clone().map(|u| format!("({u})"))),
                SqlValue::from(p.check.clone()),
                SqlValue::from("public"),
            ]
        })
        .collect();
    second.stub_query("SELECT p.polname", catalog_rows);

    let documents = compiled
        .iter()
        .find(|p| p.table.as_str() == "documents")
        .map(|p| p.table.clone())
        .unwrap();
    let report = CatalogManager::default()
        .reconcile_table(&mut second, &documents, &compiled)
        .unwrap();
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(report.unchanged.len(), 4);
}

#[rstest]
#[case::one_declaration_removed(true, &["legacy_policy"])]
#[case::every_declaration_removed(false, &["legacy_policy", "owner_policy"])]
fn test_migrate_drops_removed_declarations(#[case] keep_owner: bool, #[case] dropped: &[&str]) {
    let rls = RowSecurity::new(RlsConfig::default()).unwrap();
    let mut entity = EntityDefinition::new("Document", "documents").unwrap();
    if keep_owner {
        entity = entity.policy(Policy::user("owner_policy", "owner_id").unwrap()).unwrap();
    }
    rls.register(entity).unwrap();

    let mut session = MemorySession::new();
    let live = |name: &str, using: &str| {
        vec![
            SqlValue::from(name),
            SqlValue::from("*"),
            SqlValue::from(true),
            SqlValue::from(using),
            SqlValue::Null,
            SqlValue::from("public"),
        ]
    };
    session.stub_query(
        "SELECT p.polname",
        vec![live("legacy_policy", "true"), live("owner_policy", "(owner_id = 1)")],
    );

    let reports = rls.migrate(&mut session).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].dropped, dropped);
    let ddl = session.ddl();
    for name in dropped {
        let drop = format!("DROP POLICY IF EXISTS \"{name}\" ON \"documents\"");
        assert!(ddl.contains(&drop.as_str()), "{ddl:?}");
    }
    if keep_owner {
        assert_eq!(reports[0].altered, vec!["owner_policy"]);
    }
    assert_eq!(ddl.last(), Some(&"COMMIT"));
}

#[test]
fn test_invalid_declarations_fail_at_load() {
    let err = parse_declarations(
        r#"
        [[entity]]
        name = "Document"
        table = "documents"
        policy = { name = "p", user = "owner_id" }
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}
