use chrono::{Duration, Utc};
use tempfile::tempdir;
use uuid::Uuid;

use rivalwatch_core::{
    AgentResult, AggregatedReport, Post, ReportFilter, ReportStore, ResultAggregator,
    SqliteReportStore, StoreError,
};

fn report(results: Vec<AgentResult>, minutes_ago: i64) -> AggregatedReport {
    let mut report = ResultAggregator::aggregate(Uuid::new_v4(), results);
    report.generated_at = Utc::now() - Duration::minutes(minutes_ago);
    report
}

#[tokio::test]
async fn saved_reports_round_trip_newest_first() {
    let dir = tempdir().unwrap();
    let store = SqliteReportStore::new(dir.path().join("reports.db")).unwrap();
    store.initialize().unwrap();

    let older = report(
        vec![
            AgentResult::completed(
                "youtube",
                "acme",
                vec![Post::new().with("id", "v1").with("title", "Launch")],
                "1 recent videos from Acme",
            ),
            AgentResult::timed_out("instagram", "acme"),
        ],
        60,
    );
    let newer = report(
        vec![AgentResult::failed("facebook", "globex", "http status 500")],
        5,
    );
    store.save(&older).await.unwrap();
    store.save(&newer).await.unwrap();

    let all = store.load(&ReportFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].run_id, newer.run_id);
    assert_eq!(all[1].run_id, older.run_id);
    assert_eq!(all[1].report, older);
    assert_eq!(all[1].completed, 1);
    assert_eq!(all[1].failed, 1);

    let acme = store
        .load(&ReportFilter::default().competitor("acme"))
        .await
        .unwrap();
    assert_eq!(acme.len(), 1);
    assert_eq!(acme[0].report.posts.len(), 1);

    let latest = store.load(&ReportFilter::default().limit(1)).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].run_id, newer.run_id);
}

#[tokio::test]
async fn saving_a_run_twice_replaces_it() {
    let dir = tempdir().unwrap();
    let store = SqliteReportStore::new(dir.path().join("reports.db")).unwrap();
    store.initialize().unwrap();

    let mut run = report(vec![AgentResult::timed_out("youtube", "acme")], 0);
    store.save(&run).await.unwrap();
    run.results = vec![AgentResult::completed("youtube", "acme", Vec::new(), "0 videos")];
    run.completed = 1;
    run.failed = 0;
    store.save(&run).await.unwrap();

    let stored = store.load(&ReportFilter::default()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].completed, 1);
}

#[test]
fn read_only_store_requires_existing_database() {
    let dir = tempdir().unwrap();
    let store = SqliteReportStore::builder()
        .path(dir.path().join("missing.db"))
        .read_only(true)
        .build()
        .unwrap();
    assert!(matches!(
        store.initialize(),
        Err(StoreError::OpenDatabase { .. })
    ));
}
