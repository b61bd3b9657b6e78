use metrics_exporter_prometheus::PrometheusBuilder;

#[test]
fn store_calls_record_latency_and_errors() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    let rt = tokio::runtime::Runtime::new().unwrap();
    metrics::with_local_recorder(&recorder, || {
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("auditor.db");
            let store = common::store::Store::open(path.to_str().unwrap())
                .await
                .unwrap();

            // Writer path.
            store.queue_wallets(vec!["W1".to_string()]).await.unwrap();
            // Reader path.
            let stats = store.stats().await.unwrap();
            assert_eq!(stats.manual_queue, 1);

            let err: anyhow::Result<()> = store
                .db()
                .call_named("test.err", |conn| {
                    conn.execute("SELECT * FROM definitely_missing_table", [])?;
                    Ok(())
                })
                .await;
            assert!(err.is_err());
        });
    });

    let rendered = handle.render();
    for needle in [
        "auditor_db_query_latency_ms",
        "op=\"store.queue_wallets\"",
        "op=\"store.stats\"",
        "auditor_db_query_errors_total{op=\"test.err\"} 1",
    ] {
        assert!(
            rendered.contains(needle),
            "expected {needle} in rendered metrics, got:\n{rendered}"
        );
    }
}
