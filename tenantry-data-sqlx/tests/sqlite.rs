use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tenantry_data::backend::{Backend, Connection};
use tenantry_data::memory::MemoryBackend;
use tenantry_data::{
    run_in_transaction, Condition, Context, DataError, ListParams, QueryBuilder, Record,
    RegistryBuilder, Repository, Sort, TransactionOptions, Value,
};
use tenantry_data_sqlx::{SqlxBackend, SqlxErrorExt};

async fn setup() -> (TempDir, Arc<SqlxBackend>) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("tenantry.db").display());
    let backend = SqlxBackend::connect(&url, 4).await.unwrap();
    (dir, Arc::new(backend))
}

fn customer(name: &str) -> Record {
    Record::new()
        .with("name", name)
        .with("address", Record::new().with("city", "Lyon"))
}

async fn count(backend: &SqlxBackend, ctx: &Context, entity: &str) -> u64 {
    let (_, total) = backend
        .list(ctx, entity, &ListParams::new().normalized())
        .await
        .unwrap();
    total
}

#[tokio::test]
async fn test_create_then_read_round_trips() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();

    let created = backend
        .create(&ctx, "customers", customer("Acme").with("score", 4.5))
        .await
        .unwrap();
    let id = created.id().unwrap().to_string();
    assert!(created.contains("date_created_string"));

    let read = backend.read(&ctx, "customers", &id).await.unwrap();
    assert_eq!(read, created);
    assert_eq!(read.get_path("address.city").and_then(Value::as_str), Some("Lyon"));
    assert_eq!(read.get("score").and_then(Value::as_f64), Some(4.5));
}

#[tokio::test]
async fn test_duplicate_id_is_a_write_error() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend
        .create(&ctx, "customers", customer("Acme").with("id", "c1"))
        .await
        .unwrap();

    let err = backend
        .create(&ctx, "customers", customer("Other").with("id", "c1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Write(_)), "got {err:?}");
}

#[tokio::test]
async fn test_update_merges_and_keeps_bookkeeping() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    let created = backend
        .create(&ctx, "customers", customer("Acme").with("id", "c1"))
        .await
        .unwrap();

    let changes = Record::new()
        .with("name", "Acme Corp")
        .with("date_created", 1_600_000_000_000_i64)
        .with("active", false);
    let updated = backend.update(&ctx, "customers", "c1", changes).await.unwrap();

    assert_eq!(updated.get_str("name"), Some("Acme Corp"));
    assert_eq!(updated.get("address"), created.get("address"));
    assert_eq!(updated.get_i64("date_created"), created.get_i64("date_created"));
    assert!(updated.is_active());

    let read = backend.read(&ctx, "customers", "c1").await.unwrap();
    assert_eq!(read, updated);
}

#[tokio::test]
async fn test_soft_delete_keeps_row() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend
        .create(&ctx, "customers", customer("Acme").with("id", "c1"))
        .await
        .unwrap();

    backend.delete(&ctx, "customers", "c1").await.unwrap();

    assert!(matches!(
        backend.read(&ctx, "customers", "c1").await,
        Err(DataError::NotFound { .. })
    ));
    assert!(matches!(
        backend.delete(&ctx, "customers", "c1").await,
        Err(DataError::NotFound { .. })
    ));
    let inactive = backend
        .query(
            &ctx,
            "customers",
            &QueryBuilder::new().include_inactive().where_eq("id", "c1"),
        )
        .await
        .unwrap();
    assert_eq!(inactive.len(), 1);
    assert_eq!(inactive[0].get_bool("active"), Some(false));

    assert_eq!(count(&backend, &ctx, "customers").await, 0);
    let (listed, total) = backend
        .list(
            &ctx,
            "customers",
            &ListParams::new().include_inactive().normalized(),
        )
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(listed[0].id(), Some("c1"));
    assert_eq!(listed[0].get_bool("active"), Some(false));
}

#[tokio::test]
async fn test_list_pages_search_and_filter() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    for i in 0..25 {
        let city = if i % 2 == 0 { "Lyon" } else { "Paris" };
        backend
            .create(
                &ctx,
                "customers",
                Record::new()
                    .with("id", format!("c{i:02}"))
                    .with("name", format!("Customer {i:02}"))
                    .with("rank", i)
                    .with("city", city),
            )
            .await
            .unwrap();
    }

    let params = ListParams::new()
        .filter(Condition::eq("city", "Lyon"))
        .sort(Sort::asc("rank"))
        .page(2)
        .page_size(5)
        .normalized();
    let (items, total) = backend.list(&ctx, "customers", &params).await.unwrap();
    assert_eq!(total, 13);
    let ids: Vec<_> = items.iter().filter_map(Record::id).collect();
    assert_eq!(ids, vec!["c10", "c12", "c14", "c16", "c18"]);

    let mut params = ListParams::new().search("customer 2").normalized();
    params.search_fields = vec!["name".into()];
    let (items, total) = backend.list(&ctx, "customers", &params).await.unwrap();
    assert_eq!(total, 5);
    assert_eq!(items.len(), 5);
}

#[tokio::test]
async fn test_list_without_search_fields_matches_nothing() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.create(&ctx, "customers", customer("Acme")).await.unwrap();

    let params = ListParams::new().search("acme").normalized();
    let (items, total) = backend.list(&ctx, "customers", &params).await.unwrap();
    assert!(items.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn test_query_ranges_on_json_fields() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    for (id, amount) in [("a", 10), ("b", 200), ("c", 3000)] {
        backend
            .create(&ctx, "invoices", Record::new().with("id", id).with("amount", amount))
            .await
            .unwrap();
    }
    backend
        .create(&ctx, "invoices", Record::new().with("id", "d").with("amount", "999"))
        .await
        .unwrap();

    let found = backend
        .query(
            &ctx,
            "invoices",
            &QueryBuilder::new()
                .where_gt("amount", 50)
                .order_by("amount", false),
        )
        .await
        .unwrap();
    let ids: Vec<_> = found.iter().filter_map(Record::id).collect();
    assert_eq!(ids, vec!["c", "b"]);

    let found = backend
        .query(
            &ctx,
            "invoices",
            &QueryBuilder::new().where_in("id", ["a", "d"]).limit(1),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), Some("a"));
}

#[tokio::test]
async fn test_invalid_field_name_is_rejected() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();

    let err = backend
        .query(
            &ctx,
            "invoices",
            &QueryBuilder::new().where_eq("amount') OR 1=1 --", 1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Other(_)));

    let err = backend
        .create(&ctx, "bad\"table", customer("Acme"))
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::Other(_)));
}

#[tokio::test]
async fn test_tenant_scoping() {
    let (_dir, backend) = setup().await;
    let acme = Context::background().with_tenant("acme");
    let globex = Context::background().with_tenant("globex");

    let created = backend.create(&acme, "customers", customer("Ada")).await.unwrap();
    backend.create(&globex, "customers", customer("Bob")).await.unwrap();
    assert_eq!(created.tenant_id(), Some("acme"));

    assert!(matches!(
        backend.read(&globex, "customers", created.id().unwrap()).await,
        Err(DataError::NotFound { .. })
    ));
    assert_eq!(count(&backend, &acme, "customers").await, 1);
    assert_eq!(count(&backend, &Context::background(), "customers").await, 2);
}

#[tokio::test]
async fn test_transaction_commits_all_writes() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new().with("id", "seed")).await.unwrap();

    let manager = backend.transactions();
    let inner = backend.clone();
    let ids = run_in_transaction(&*manager, &ctx, TransactionOptions::new(), |tx_ctx| async move {
        let a = inner.create(&tx_ctx, "orders", Record::new().with("n", 1)).await?;
        let b = inner.create(&tx_ctx, "orders", Record::new().with("n", 2)).await?;
        let read = inner.read(&tx_ctx, "orders", a.id().unwrap_or_default()).await?;
        assert_eq!(read.get_i64("n"), Some(1));
        Ok(vec![a.id().map(str::to_string), b.id().map(str::to_string)])
    })
    .await
    .unwrap();

    assert_eq!(ids.len(), 2);
    assert_eq!(count(&backend, &ctx, "orders").await, 3);
}

#[tokio::test]
async fn test_transaction_error_rolls_back() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new().with("id", "seed")).await.unwrap();

    let manager = backend.transactions();
    let inner = backend.clone();
    let result: Result<(), DataError> =
        run_in_transaction(&*manager, &ctx, TransactionOptions::new(), |tx_ctx| async move {
            inner.create(&tx_ctx, "orders", Record::new().with("n", 1)).await?;
            inner.update(&tx_ctx, "orders", "seed", Record::new().with("n", 9)).await?;
            inner.create(&tx_ctx, "orders", Record::new().with("id", "seed")).await?;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(DataError::Write(_))), "got {result:?}");
    assert_eq!(count(&backend, &ctx, "orders").await, 1);
    let seed = backend.read(&ctx, "orders", "seed").await.unwrap();
    assert_eq!(seed.get("n"), None);
}

#[tokio::test]
async fn test_uncommitted_writes_are_invisible_outside() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new().with("id", "seed")).await.unwrap();

    let manager = backend.transactions();
    let inner = backend.clone();
    let outer_ctx = ctx.clone();
    run_in_transaction(&*manager, &ctx, TransactionOptions::new(), |tx_ctx| async move {
        inner.create(&tx_ctx, "orders", Record::new().with("id", "pending")).await?;
        let outside = inner.read(&outer_ctx, "orders", "pending").await;
        assert!(matches!(outside, Err(DataError::NotFound { .. })));
        Ok(())
    })
    .await
    .unwrap();

    assert!(backend.read(&ctx, "orders", "pending").await.is_ok());
}

#[tokio::test]
async fn test_nested_unit_joins_outer_transaction() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new().with("id", "seed")).await.unwrap();

    let manager = backend.transactions();
    let inner = backend.clone();
    let result: Result<(), DataError> =
        run_in_transaction(&*manager, &ctx, TransactionOptions::new(), |tx_ctx| {
            let manager = manager.clone();
            async move {
                let outer_tx = tx_ctx.transaction().map(|tx| tx.id());
                run_in_transaction(&*manager, &tx_ctx, TransactionOptions::new(), |nested| {
                    let inner = inner.clone();
                    async move {
                        assert_eq!(nested.transaction().map(|tx| tx.id()), outer_tx);
                        inner.create(&nested, "orders", Record::new().with("n", 1)).await?;
                        Ok(())
                    }
                })
                .await?;
                Err(DataError::Other("outer failed".into()))
            }
        })
        .await;

    assert!(result.is_err());
    assert_eq!(count(&backend, &ctx, "orders").await, 1);
}

#[tokio::test]
async fn test_transaction_timeout_rolls_back() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new().with("id", "seed")).await.unwrap();

    let manager = backend.transactions();
    let inner = backend.clone();
    let options = TransactionOptions::new().timeout(Duration::from_millis(100));
    let result = run_in_transaction(&*manager, &ctx, options, |tx_ctx| async move {
        inner.create(&tx_ctx, "orders", Record::new().with("n", 1)).await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    })
    .await;

    assert!(matches!(result, Err(DataError::DeadlineExceeded)), "got {result:?}");
    assert_eq!(count(&backend, &ctx, "orders").await, 1);
}

#[tokio::test]
async fn test_operation_after_timeout_fails() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new().with("id", "seed")).await.unwrap();

    let manager = backend.transactions();
    let inner = backend.clone();
    let options = TransactionOptions::new().timeout(Duration::from_millis(50));
    let result: Result<(), DataError> = run_in_transaction(&*manager, &ctx, options, |tx_ctx| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        inner.create(&tx_ctx, "orders", Record::new().with("n", 1)).await?;
        Ok(())
    })
    .await;

    assert!(matches!(result, Err(ref e) if e.is_interrupted()), "got {result:?}");
    assert_eq!(count(&backend, &ctx, "orders").await, 1);
}

#[tokio::test]
async fn test_panic_rolls_back() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new().with("id", "seed")).await.unwrap();

    let task_backend = backend.clone();
    let handle = tokio::spawn(async move {
        let manager = task_backend.transactions();
        let inner = task_backend.clone();
        let ctx = Context::background();
        let _: Result<(), DataError> =
            run_in_transaction(&*manager, &ctx, TransactionOptions::new(), |tx_ctx| async move {
                inner.create(&tx_ctx, "orders", Record::new().with("n", 1)).await?;
                panic!("boom");
            })
            .await;
    });

    let err = handle.await.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(count(&backend, &ctx, "orders").await, 1);
}

#[tokio::test]
async fn test_read_only_transaction_rejects_writes() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new().with("id", "seed")).await.unwrap();

    let manager = backend.transactions();
    let inner = backend.clone();
    let result: Result<(), DataError> =
        run_in_transaction(&*manager, &ctx, TransactionOptions::new().read_only(), |tx_ctx| {
            async move {
                inner.read(&tx_ctx, "orders", "seed").await?;
                inner.create(&tx_ctx, "orders", Record::new().with("n", 1)).await?;
                Ok(())
            }
        })
        .await;

    assert!(matches!(result, Err(DataError::Write(_))));
    assert_eq!(count(&backend, &ctx, "orders").await, 1);
}

#[tokio::test]
async fn test_foreign_transaction_is_rejected() {
    let (_dir_a, first) = setup().await;
    let (_dir_b, second) = setup().await;
    let ctx = Context::background();

    let tx = first
        .transactions()
        .start(&ctx, TransactionOptions::new())
        .await
        .unwrap();
    let err = second
        .create(&ctx.with_transaction(tx.clone()), "orders", Record::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::ConnectionMismatch { .. }));
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_raw_query_through_repository() {
    let (_dir, backend) = setup().await;
    let mut builder = RegistryBuilder::new();
    tenantry_data_sqlx::register(&mut builder, "customer", &["name"]).unwrap();
    let registry = builder.build();
    let customers = registry
        .create("sqlite", "customer", backend.clone(), "customers")
        .unwrap();
    let ctx = Context::background();
    customers.create(&ctx, customer("Acme")).await.unwrap();
    customers.create(&ctx, customer("Globex")).await.unwrap();

    let raw = customers.as_raw_query().unwrap();
    let rows = raw
        .raw_query(
            &ctx,
            "SELECT json_extract(data, '$.name') AS name, active, 1.5 AS ratio \
             FROM customers WHERE json_extract(data, '$.name') = ?",
            &[Value::from("Globex")],
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_str("name"), Some("Globex"));
    assert_eq!(rows[0].get_i64("active"), Some(1));
    assert_eq!(rows[0].get("ratio").and_then(Value::as_f64), Some(1.5));

    let rows = raw
        .raw_query(&ctx, "SELECT ? IS NULL AS missing", &[Value::Null])
        .await
        .unwrap();
    assert_eq!(rows[0].get_i64("missing"), Some(1));
}

#[tokio::test]
async fn test_repository_searches_configured_fields() {
    let (_dir, backend) = setup().await;
    let mut builder = RegistryBuilder::new();
    tenantry_data_sqlx::register(&mut builder, "customer", &["name", "address.city"]).unwrap();
    let customers = builder
        .build()
        .create("sqlite", "customer", backend, "customers")
        .unwrap();
    let ctx = Context::background();
    customers.create(&ctx, customer("Acme")).await.unwrap();
    customers
        .create(
            &ctx,
            Record::new()
                .with("name", "Globex")
                .with("address", Record::new().with("city", "Berlin")),
        )
        .await
        .unwrap();

    let (items, total) = customers
        .list(&ctx, &ListParams::new().search("LYON"))
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(items[0].get_str("name"), Some("Acme"));
}

#[tokio::test]
async fn test_ping_and_cancellation() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.ping(&ctx).await.unwrap();

    let cancelled = ctx.child();
    cancelled.cancel();
    assert!(matches!(
        backend.create(&cancelled, "orders", Record::new()).await,
        Err(DataError::Cancelled)
    ));
    assert!(matches!(backend.ping(&cancelled).await, Err(DataError::Cancelled)));
}

#[tokio::test]
async fn test_sqlx_errors_are_bridged() {
    let (_dir, backend) = setup().await;
    let err = sqlx::query("SELECT * FROM missing_table")
        .execute(backend.pool())
        .await
        .map_err(SqlxErrorExt::into_data_error)
        .unwrap_err();
    assert!(matches!(err, DataError::Database(_)));
    assert!(std::error::Error::source(&err).is_some());
}

#[tokio::test]
async fn test_page_far_past_the_end_is_empty() {
    let (_dir, backend) = setup().await;
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new()).await.unwrap();

    let (items, total) = backend
        .list(
            &ctx,
            "orders",
            &ListParams::new().page(i64::MAX).page_size(1000).normalized(),
        )
        .await
        .unwrap();
    assert!(items.is_empty());
    assert_eq!(total, 1);
}

#[tokio::test]
async fn test_timestamp_companions_match_memory_backend() {
    let (_dir, sqlite) = setup().await;
    let backends: [Arc<dyn Backend>; 2] = [sqlite, Arc::new(MemoryBackend::new())];
    let ctx = Context::background();

    for backend in backends {
        let created = backend.create(&ctx, "orders", Record::new()).await.unwrap();
        let stamp = created.get_str("date_created_string").unwrap().to_string();

        let exact = backend
            .query(
                &ctx,
                "orders",
                &QueryBuilder::new().where_eq("date_created_string", stamp.as_str()),
            )
            .await
            .unwrap();
        assert_eq!(exact.len(), 1, "{}", backend.backend_name());

        let (_, total) = backend
            .list(
                &ctx,
                "orders",
                &ListParams::new()
                    .filter(Condition::Like("date_modified_string".into(), stamp[..4].into()))
                    .sort(Sort::asc("date_created_string"))
                    .normalized(),
            )
            .await
            .unwrap();
        assert_eq!(total, 1, "{}", backend.backend_name());
    }
}

#[tokio::test]
async fn test_in_memory_database_inside_transaction() {
    let backend = Arc::new(SqlxBackend::connect("sqlite::memory:", 4).await.unwrap());
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new().with("id", "seed")).await.unwrap();

    let manager = backend.transactions();
    let inner = backend.clone();
    let outside = ctx.clone();
    run_in_transaction(&*manager, &ctx, TransactionOptions::new(), |tx_ctx| async move {
        inner.ping(&tx_ctx.with_timeout(Duration::from_secs(2))).await?;
        inner.read(&tx_ctx, "orders", "seed").await?;

        // The transaction holds the only connection.
        let err = inner.create(&outside, "orders", Record::new()).await.unwrap_err();
        assert!(matches!(err, DataError::Other(_)), "got {err:?}");
        assert!(matches!(inner.ping(&outside).await, Err(DataError::Other(_))));
        assert!(matches!(
            inner.transactions().start(&outside, TransactionOptions::new()).await,
            Err(DataError::Other(_))
        ));
        Ok(())
    })
    .await
    .unwrap();

    backend.ping(&ctx).await.unwrap();
    assert_eq!(count(&backend, &ctx, "orders").await, 1);
}

#[tokio::test]
async fn test_read_only_raw_queries_cannot_write() {
    let backend = Arc::new(SqlxBackend::connect("sqlite::memory:", 4).await.unwrap());
    let ctx = Context::background();
    backend.create(&ctx, "orders", Record::new().with("id", "seed")).await.unwrap();

    let manager = backend.transactions();
    let inner = backend.clone();
    run_in_transaction(&*manager, &ctx, TransactionOptions::new().read_only(), |tx_ctx| {
        async move {
            let raw = inner.raw_query_capable().unwrap();
            let err = raw
                .raw_query(&tx_ctx, "WITH doomed AS (SELECT 1) DELETE FROM orders", &[])
                .await
                .unwrap_err();
            assert!(matches!(err, DataError::Write(_)), "got {err:?}");
            assert!(raw.raw_query(&tx_ctx, "PRAGMA query_only = OFF", &[]).await.is_err());

            // Only the engine guard stops the second statement.
            let _ = raw.raw_query(&tx_ctx, "SELECT 1; DELETE FROM orders", &[]).await;
            let rows = raw.raw_query(&tx_ctx, "SELECT COUNT(*) AS n FROM orders", &[]).await?;
            assert_eq!(rows[0].get_i64("n"), Some(1));
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(count(&backend, &ctx, "orders").await, 1);
    backend.create(&ctx, "orders", Record::new()).await.unwrap();
    assert_eq!(count(&backend, &ctx, "orders").await, 2);
}
