//! Cross-module gateway behavior that needs no live database: script
//! classification feeding the rewriter, request fingerprints feeding the
//! cache, and the invalidation rules connecting them.

use dbc::cache::{fingerprint, FingerprintInput, ResponseCache};
use dbc::db::executor::first_statement;
use dbc::db::types::{Filter, Sort};
use dbc::sql::classifier::{self, StatementKind};
use dbc::sql::rewriter::{self, BaseColumn, PageRequest};

fn columns(names: &[&str]) -> Vec<BaseColumn> {
    names
        .iter()
        .map(|n| BaseColumn {
            name: (*n).to_owned(),
            cast_text: false,
        })
        .collect()
}

#[test]
fn script_split_and_rejoin_reproduces_statements() {
    let script = "SELECT 1;\n-- note\nUPDATE t SET a = 'x;y';\n\nCREATE TABLE z(id int)";
    let statements = classifier::classify_script(script);
    assert_eq!(statements.len(), 3);

    // each statement's byte range points back into the script verbatim
    for stmt in &statements {
        assert_eq!(&script[stmt.start..=stmt.end], stmt.text);
    }

    let kinds: Vec<StatementKind> = statements.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StatementKind::Select,
            StatementKind::ModifyData,
            StatementKind::ModifyStructure
        ]
    );
}

#[test]
fn probe_param_count_matches_max_ordinal() {
    // the universal property: params length == max $N outside strings/comments
    let cases = [
        ("SELECT 1", 0),
        ("SELECT * FROM t WHERE id = $1 AND name LIKE $2", 2),
        ("SELECT '$3', $1 -- $4\n, $2", 2),
        ("SELECT $2 /* second */, $1", 2),
    ];
    for (sql, expected) in cases {
        let stmt = first_statement(sql).unwrap();
        assert_eq!(stmt.max_param(), expected, "{sql}");
        assert_eq!(stmt.params.len() as u32, expected, "{sql}");
    }
}

#[test]
fn scenario_select_one_page_one() {
    // POST /query {"query":"SELECT 1 AS x;","page":1,"page_size":10}
    let stmt = first_statement("SELECT 1 AS x;").unwrap();
    assert_eq!(stmt.kind, StatementKind::Select);
    assert_eq!(stmt.text, "SELECT 1 AS x");

    let rw = rewriter::paginate(
        &stmt.text,
        &columns(&["x"]),
        stmt.max_param(),
        &PageRequest {
            page: 1,
            page_size: 10,
            sort: None,
            filters: Vec::new(),
        },
    )
    .unwrap();
    assert!(rw.sql.contains("AS __total"));
    assert!(rw.sql.ends_with("LIMIT 10 OFFSET 0"));
}

#[test]
fn scenario_sorted_second_page() {
    // page 2, size 3, sort DESC on column 0 -> ORDER BY 2 DESC LIMIT 3 OFFSET 3
    let stmt = first_statement("SELECT n FROM generate_series(1,7) n;").unwrap();
    let sort: Sort = serde_json::from_str(r#"{"column_idx":0,"direction":"DESC"}"#).unwrap();
    let rw = rewriter::paginate(
        &stmt.text,
        &columns(&["n"]),
        0,
        &PageRequest {
            page: 2,
            page_size: 3,
            sort: Some(sort),
            filters: Vec::new(),
        },
    )
    .unwrap();
    assert!(rw.sql.contains("ORDER BY 2 DESC"));
    assert!(rw.sql.ends_with("LIMIT 3 OFFSET 3"));
}

#[test]
fn ddl_statement_classifies_as_structure_change() {
    let stmt = first_statement("CREATE TABLE x(id int);").unwrap();
    assert_eq!(stmt.kind, StatementKind::ModifyStructure);
    let stmt = first_statement("UPDATE t SET a=1 WHERE false;").unwrap();
    assert_eq!(stmt.kind, StatementKind::ModifyData);
    assert_eq!(stmt.referenced_tables(), vec!["t".to_owned()]);
}

#[test]
fn misspelled_keyword_is_unknown_not_rejected() {
    // "SELEKT 1" must reach the server so it can report 42601 at position 1
    let stmt = first_statement("SELEKT 1").unwrap();
    assert_eq!(stmt.kind, StatementKind::Unknown);
}

#[test]
fn fingerprint_stable_under_json_key_reordering() {
    let filters_a: Vec<Filter> = serde_json::from_str(
        r#"[{"type":"integer","index":0,"column":"id","operator":"gte","value":5}]"#,
    )
    .unwrap();
    let filters_b: Vec<Filter> = serde_json::from_str(
        r#"[{"value":5,"operator":"gte","column":"id","index":0,"type":"integer"}]"#,
    )
    .unwrap();
    let params = vec![serde_json::json!("a")];

    let a = fingerprint(&FingerprintInput {
        connection: "c",
        database: "d",
        statement: "SELECT * FROM t WHERE x = $1",
        params: &params,
        sort: &None,
        filters: &filters_a,
        page: 1,
        page_size: 50,
    });
    let b = fingerprint(&FingerprintInput {
        connection: "c",
        database: "d",
        statement: "SELECT * FROM t WHERE x = $1",
        params: &params,
        sort: &None,
        filters: &filters_b,
        page: 1,
        page_size: 50,
    });
    assert_eq!(a, b);
}

#[test]
fn fingerprint_distinguishes_every_request_dimension() {
    let params = vec![serde_json::json!(1)];
    let base = FingerprintInput {
        connection: "c",
        database: "d",
        statement: "SELECT $1",
        params: &params,
        sort: &None,
        filters: &[],
        page: 1,
        page_size: 10,
    };
    let reference = fingerprint(&base);

    let other_params = vec![serde_json::json!(2)];
    let variations = [
        FingerprintInput {
            connection: "c2",
            ..base_clone(&params)
        },
        FingerprintInput {
            database: "d2",
            ..base_clone(&params)
        },
        FingerprintInput {
            statement: "SELECT $1 + 0",
            ..base_clone(&params)
        },
        FingerprintInput {
            params: &other_params,
            ..base_clone(&params)
        },
        FingerprintInput {
            page: 2,
            ..base_clone(&params)
        },
        FingerprintInput {
            page_size: 20,
            ..base_clone(&params)
        },
    ];
    for variant in variations {
        assert_ne!(reference, fingerprint(&variant));
    }
}

fn base_clone(params: &[serde_json::Value]) -> FingerprintInput<'_> {
    FingerprintInput {
        connection: "c",
        database: "d",
        statement: "SELECT $1",
        params,
        sort: &None,
        filters: &[],
        page: 1,
        page_size: 10,
    }
}

#[test]
fn structure_change_empties_the_bucket_for_subsequent_reads() {
    let cache = ResponseCache::default();
    let stmt = first_statement("SELECT * FROM widgets").unwrap();
    let fp = fingerprint(&FingerprintInput {
        connection: "local",
        database: "postgres",
        statement: &stmt.text,
        params: &[],
        sort: &None,
        filters: &[],
        page: 1,
        page_size: 100,
    });
    cache.put(
        fp.clone(),
        "local",
        "postgres",
        stmt.referenced_tables(),
        r#"{"type":"select"}"#.into(),
        None,
    );
    assert!(cache.get(&fp).is_some());

    // CREATE TABLE on the same (connection, database)
    cache.invalidate_db("local", "postgres");
    assert!(cache.get(&fp).is_none());
}

#[test]
fn data_change_uses_classifier_tables_for_targeted_invalidation() {
    let cache = ResponseCache::default();
    let select_widgets = first_statement("SELECT * FROM widgets w").unwrap();
    let select_users = first_statement("SELECT * FROM users").unwrap();

    cache.put(
        "fp-widgets".into(),
        "local",
        "postgres",
        select_widgets.referenced_tables(),
        "w".into(),
        None,
    );
    cache.put(
        "fp-users".into(),
        "local",
        "postgres",
        select_users.referenced_tables(),
        "u".into(),
        None,
    );

    let update = first_statement("UPDATE widgets SET price = 0").unwrap();
    assert_eq!(update.kind, StatementKind::ModifyData);
    cache.invalidate_tables("local", "postgres", &update.referenced_tables());

    assert!(cache.get("fp-widgets").is_none());
    assert!(cache.get("fp-users").is_some());
}

#[test]
fn explain_statements_are_cacheable_and_classified() {
    let stmt = first_statement("EXPLAIN SELECT * FROM t").unwrap();
    assert_eq!(stmt.kind, StatementKind::Explain);
    assert_eq!(stmt.explain_inner(), Some(StatementKind::Select));

    let form = rewriter::explain_form(&stmt.text).unwrap();
    assert_eq!(form.sql, "EXPLAIN (FORMAT JSON, ANALYZE false) SELECT * FROM t");

    // EXPLAIN ANALYZE is pinned to verbatim pass-through
    let stmt = first_statement("EXPLAIN ANALYZE SELECT * FROM t").unwrap();
    let form = rewriter::explain_form(&stmt.text).unwrap();
    assert_eq!(form.sql, "EXPLAIN ANALYZE SELECT * FROM t");
}

#[test]
fn active_statement_tracks_cursor_between_semicolons() {
    let script = "-- intro\nSELECT a FROM t;\n\nUPDATE t SET a = 1\nWHERE id = 2;\n-- outro";
    let cursor = script.find("WHERE").unwrap();
    let (start, end) = classifier::active_statement(script, cursor).unwrap();
    assert_eq!(&script[start..=end], "UPDATE t SET a = 1\nWHERE id = 2");
}
