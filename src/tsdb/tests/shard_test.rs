use std::collections::BTreeMap;
use std::sync::Arc;

use common_base::influxql::{BinaryOp, DataType, Expr};
use common_base::point::{FieldValue, Point, Tags};
use tokio_util::sync::CancellationToken;

use tsidb::config::{Config, EngineOptions, IndexType};
use tsidb::engine::MemPointStore;
use tsidb::errors::{IndexError, PartialWriteError};
use common_base::iterator::TryIterator;
use tsidb::shard::Shard;

fn options(index_type: IndexType, max_values_per_tag: u64) -> EngineOptions {
    EngineOptions {
        index_type,
        config: Config {
            max_values_per_tag,
            ..Config::default()
        },
    }
}

async fn open_shard(
    dir: &std::path::Path,
    opt: EngineOptions,
) -> (Arc<Shard>, Arc<MemPointStore>) {
    let store = Arc::new(MemPointStore::new());
    let shard = Arc::new(Shard::new(
        1,
        dir.join("shard").to_str().unwrap(),
        dir.join("wal").to_str().unwrap(),
        "db0",
        "rp0",
        store.clone(),
        opt,
    ));
    shard.open().await.unwrap();
    shard.set_enabled(true);
    (shard, store)
}

fn point(name: &[u8], tags: Vec<(&[u8], &[u8])>, time: i64, fields: Vec<(&str, FieldValue)>) -> Point {
    let fields: BTreeMap<String, FieldValue> = fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    Point::new(name.to_vec(), Tags::from_pairs(tags), time, fields)
}

fn tag_eq(key: &str, value: &str) -> Expr {
    Expr::binary(
        BinaryOp::Eq,
        Expr::tag_ref(key),
        Expr::StringLiteral(value.to_string()),
    )
}

async fn series_ids(shard: &Shard, name: &[u8]) -> Vec<u64> {
    let mut itr = shard
        .measurement_series_by_expr(name, None, CancellationToken::new())
        .await
        .unwrap();
    let mut ids = Vec::new();
    while let Some(elem) = itr.try_next().unwrap() {
        ids.push(elem.series_id);
    }
    ids
}

/// A full merged view of the index, used to compare states across
/// compaction and reopen.
#[derive(Debug, PartialEq, Eq)]
struct IndexView {
    measurements: Vec<Vec<u8>>,
    tags: Vec<(Vec<u8>, Vec<u8>, Vec<Vec<u8>>)>,
    series: Vec<(Vec<u8>, Vec<u64>)>,
}

async fn index_view(shard: &Shard) -> IndexView {
    let (measurements, _) = shard.measurements_by_expr(None).await.unwrap();

    let mut tags = Vec::new();
    let mut series = Vec::new();
    for name in &measurements {
        series.push((name.clone(), series_ids(shard, name).await));

        for key in shard.tag_keys(name).await.unwrap() {
            let values = shard.tag_values(name, &key).await.unwrap();
            tags.push((name.clone(), key, values));
        }
    }
    tags.sort();

    IndexView {
        measurements,
        tags,
        series,
    }
}

#[tokio::test]
async fn test_write_then_read_single_point() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, store) = open_shard(dir.as_ref(), options(IndexType::Tsi1, 0)).await;

    shard
        .write_points(vec![point(
            b"cpu",
            vec![(b"host", b"A")],
            1,
            vec![("value", FieldValue::Float(23.2))],
        )])
        .await
        .unwrap();

    assert_eq!(shard.series_n().await.unwrap(), 1);

    let (names, ok) = shard
        .measurements_by_expr(Some(&tag_eq("host", "A")))
        .await
        .unwrap();
    assert_eq!(names, vec![b"cpu".to_vec()]);
    assert!(ok);

    let mf = shard.measurement_fields(b"cpu").await.unwrap().unwrap();
    let field = mf.field_by_name("value").unwrap();
    assert_eq!(field.id, 1);
    assert_eq!(field.data_type, DataType::Float);

    assert_eq!(store.point_n(), 1);

    let stats = shard.statistics();
    assert_eq!(stats.write_req, 1);
    assert_eq!(stats.write_req_ok, 1);
    assert_eq!(stats.write_points_ok, 1);
    assert_eq!(stats.write_points_dropped, 0);
}

#[tokio::test]
async fn test_field_type_conflict_is_fatal_but_preserves_prior_writes() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, store) = open_shard(dir.as_ref(), options(IndexType::Tsi1, 0)).await;

    shard
        .write_points(vec![point(
            b"cpu",
            vec![],
            1,
            vec![("value", FieldValue::Float(1.0))],
        )])
        .await
        .unwrap();

    let err = shard
        .write_points(vec![point(
            b"cpu",
            vec![],
            2,
            vec![("value", FieldValue::Integer(2))],
        )])
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::FieldTypeConflict { .. })
    ));

    // The first point stays indexed and stored.
    assert_eq!(shard.series_n().await.unwrap(), 1);
    assert_eq!(store.point_n(), 1);
    let mf = shard.measurement_fields(b"cpu").await.unwrap().unwrap();
    assert_eq!(mf.field_by_name("value").unwrap().data_type, DataType::Float);
}

#[tokio::test]
async fn test_max_values_per_tag_drops_point() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _store) = open_shard(dir.as_ref(), options(IndexType::Tsi1, 2)).await;

    for host in [b"A".as_slice(), b"B"] {
        shard
            .write_points(vec![point(
                b"cpu",
                vec![(b"host", host)],
                1,
                vec![("value", FieldValue::Float(1.0))],
            )])
            .await
            .unwrap();
    }
    assert_eq!(shard.series_n().await.unwrap(), 2);

    let err = shard
        .write_points(vec![point(
            b"cpu",
            vec![(b"host", b"C")],
            1,
            vec![("value", FieldValue::Float(1.0))],
        )])
        .await
        .unwrap_err();
    let partial = err.downcast_ref::<PartialWriteError>().unwrap();
    assert_eq!(partial.dropped, 1);

    assert_eq!(shard.series_n().await.unwrap(), 2);
    assert_eq!(shard.statistics().write_points_dropped, 1);
}

#[tokio::test]
async fn test_drop_then_recreate_assigns_new_id() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _store) = open_shard(dir.as_ref(), options(IndexType::Tsi1, 0)).await;

    shard
        .write_points(vec![point(
            b"cpu",
            vec![(b"host", b"A")],
            1,
            vec![("v", FieldValue::Float(1.0))],
        )])
        .await
        .unwrap();
    let old = series_ids(&shard, b"cpu").await;
    assert_eq!(old.len(), 1);

    let key = tsidb::series::series_key::encode_series_key(
        b"cpu",
        &Tags::from_pairs(vec![(b"host".as_slice(), b"A".as_slice())]),
    );
    shard.delete_series(vec![key]).await.unwrap();
    assert_eq!(shard.series_n().await.unwrap(), 0);
    assert!(series_ids(&shard, b"cpu").await.is_empty());

    shard
        .write_points(vec![point(
            b"cpu",
            vec![(b"host", b"A")],
            2,
            vec![("v", FieldValue::Float(2.0))],
        )])
        .await
        .unwrap();
    let new = series_ids(&shard, b"cpu").await;
    assert_eq!(new.len(), 1);
    assert!(new[0] > old[0], "id {} must exceed dropped id {}", new[0], old[0]);
}

#[tokio::test]
async fn test_log_recovery_after_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let opt = options(IndexType::Tsi1, 0);

    {
        let (shard, _store) = open_shard(dir.as_ref(), opt.clone()).await;
        for host in [b"A".as_slice(), b"B", b"C"] {
            shard
                .write_points(vec![point(
                    b"cpu",
                    vec![(b"host", host)],
                    1,
                    vec![("v", FieldValue::Float(1.0))],
                )])
                .await
                .unwrap();
        }
        assert_eq!(series_ids(&shard, b"cpu").await.len(), 3);
        shard.close().await.unwrap();
    }

    // Corrupt the final 3 bytes of the log.
    let log_path = dir.as_ref().join("shard/index/0001.tsi.log");
    let mut buf = std::fs::read(&log_path).unwrap();
    let n = buf.len();
    for b in &mut buf[n - 3..] {
        *b ^= 0xff;
    }
    std::fs::write(&log_path, &buf).unwrap();

    let (shard, _store) = open_shard(dir.as_ref(), opt).await;
    let ids = series_ids(&shard, b"cpu").await;
    assert_eq!(ids.len(), 2, "truncated create must be absent");

    // Subsequent writes succeed and re-index the lost series.
    shard
        .write_points(vec![point(
            b"cpu",
            vec![(b"host", b"C")],
            2,
            vec![("v", FieldValue::Float(2.0))],
        )])
        .await
        .unwrap();
    assert_eq!(series_ids(&shard, b"cpu").await.len(), 3);
}

#[tokio::test]
async fn test_compaction_preserves_merged_view() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _store) = open_shard(dir.as_ref(), options(IndexType::Tsi1, 0)).await;

    // A few hundred creates plus some drops.
    let mut points = Vec::new();
    for i in 0..300_u64 {
        points.push(point(
            if i % 3 == 0 { b"cpu" } else { b"mem" },
            vec![
                (b"host", format!("host-{:03}", i % 50).as_bytes()),
                (b"region", if i % 2 == 0 { b"us" } else { b"eu" }),
            ],
            i as i64,
            vec![("v", FieldValue::Float(i as f64))],
        ));
    }
    shard.write_points(points).await.unwrap();

    for i in 0..30_u64 {
        let key = tsidb::series::series_key::encode_series_key(
            b"mem",
            &Tags::from_pairs(vec![
                (b"host".as_slice(), format!("host-{:03}", (i * 2 + 1) % 50).as_bytes()),
                (b"region", if (i * 2 + 1) % 2 == 0 { b"us" } else { b"eu" }),
            ]),
        );
        shard.delete_series(vec![key]).await.unwrap();
    }

    let before = index_view(&shard).await;
    let hosts_before = shard
        .tag_sets(b"cpu", &["host".to_string()], None)
        .await
        .unwrap()
        .len();

    shard.compact(CancellationToken::new()).await.unwrap();

    let after = index_view(&shard).await;
    assert_eq!(before, after);
    assert_eq!(
        shard
            .tag_sets(b"cpu", &["host".to_string()], None)
            .await
            .unwrap()
            .len(),
        hosts_before
    );

    // Compaction is idempotent.
    shard.compact(CancellationToken::new()).await.unwrap();
    assert_eq!(index_view(&shard).await, after);
}

#[tokio::test]
async fn test_close_open_preserves_observable_state() {
    let dir = tempfile::tempdir().unwrap();
    let opt = options(IndexType::Tsi1, 0);

    let before = {
        let (shard, _store) = open_shard(dir.as_ref(), opt.clone()).await;
        for i in 0..20_u64 {
            shard
                .write_points(vec![point(
                    b"cpu",
                    vec![(b"host", format!("h{}", i).as_bytes())],
                    i as i64,
                    vec![("v", FieldValue::Float(1.0))],
                )])
                .await
                .unwrap();
        }
        // Compact half-way so state spans an index file and a log.
        shard.compact(CancellationToken::new()).await.unwrap();
        for i in 20..25_u64 {
            shard
                .write_points(vec![point(
                    b"cpu",
                    vec![(b"host", format!("h{}", i).as_bytes())],
                    i as i64,
                    vec![("v", FieldValue::Float(1.0))],
                )])
                .await
                .unwrap();
        }

        let view = index_view(&shard).await;
        let n = shard.series_n().await.unwrap();
        shard.close().await.unwrap();
        (view, n)
    };

    let (shard, _store) = open_shard(dir.as_ref(), opt).await;
    assert_eq!(shard.series_n().await.unwrap(), before.1);
    assert_eq!(index_view(&shard).await, before.0);
}

#[tokio::test]
async fn test_state_machine_gating() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemPointStore::new());
    let shard = Shard::new(
        7,
        dir.as_ref().join("shard").to_str().unwrap(),
        dir.as_ref().join("wal").to_str().unwrap(),
        "db0",
        "rp0",
        store,
        options(IndexType::Tsi1, 0),
    );

    // Closed.
    let err = shard.series_n().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::EngineClosed)
    ));

    // Open but disabled.
    shard.open().await.unwrap();
    let err = shard
        .write_points(vec![point(b"cpu", vec![], 1, vec![("v", FieldValue::Float(1.0))])])
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::ShardDisabled)
    ));

    // Enabled.
    shard.set_enabled(true);
    shard
        .write_points(vec![point(b"cpu", vec![], 1, vec![("v", FieldValue::Float(1.0))])])
        .await
        .unwrap();

    // Disabled again.
    shard.set_enabled(false);
    assert!(shard.series_n().await.is_err());

    shard.close().await.unwrap();
    shard.close().await.unwrap(); // idempotent
}

#[tokio::test]
async fn test_time_tag_and_field_are_stripped() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, store) = open_shard(dir.as_ref(), options(IndexType::Tsi1, 0)).await;

    shard
        .write_points(vec![point(
            b"cpu",
            vec![(b"time", b"oops"), (b"host", b"a")],
            1,
            vec![("value", FieldValue::Float(1.0)), ("time", FieldValue::Integer(9))],
        )])
        .await
        .unwrap();

    // The series key carries only the host tag.
    let ids = series_ids(&shard, b"cpu").await;
    assert_eq!(ids.len(), 1);
    let mf = shard.measurement_fields(b"cpu").await.unwrap().unwrap();
    assert!(mf.field_by_name("time").is_none());
    assert!(mf.field_by_name("value").is_some());
    assert_eq!(store.point_n(), 1);

    // A point with only reserved fields is skipped entirely.
    shard
        .write_points(vec![point(
            b"cpu",
            vec![(b"host", b"a")],
            2,
            vec![("time", FieldValue::Integer(1))],
        )])
        .await
        .unwrap();
    assert_eq!(store.point_n(), 1);
}

#[tokio::test]
async fn test_predicates_and_residual_filters() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, _store) = open_shard(dir.as_ref(), options(IndexType::Tsi1, 0)).await;

    shard
        .write_points(vec![
            point(b"cpu", vec![(b"host", b"a"), (b"region", b"us")], 1, vec![("value", FieldValue::Float(1.0))]),
            point(b"cpu", vec![(b"host", b"b"), (b"region", b"us")], 1, vec![("value", FieldValue::Float(2.0))]),
            point(b"cpu", vec![(b"host", b"c"), (b"region", b"eu")], 1, vec![("value", FieldValue::Float(3.0))]),
        ])
        .await
        .unwrap();

    // _name AND tag equality.
    let expr = Expr::binary(
        BinaryOp::And,
        Expr::binary(
            BinaryOp::Eq,
            Expr::tag_ref("_name"),
            Expr::StringLiteral("cpu".to_string()),
        ),
        tag_eq("region", "us"),
    );
    let mut itr = shard
        .measurement_series_by_expr(b"cpu", Some(&expr), CancellationToken::new())
        .await
        .unwrap();
    let mut n = 0;
    while let Some(elem) = itr.try_next().unwrap() {
        assert!(elem.expr.is_none());
        n += 1;
    }
    assert_eq!(n, 2);

    // Regex union.
    let expr = Expr::binary(
        BinaryOp::EqRegex,
        Expr::tag_ref("host"),
        Expr::RegexLiteral(regex::Regex::new("^[ab]$").unwrap()),
    );
    let mut itr = shard
        .measurement_series_by_expr(b"cpu", Some(&expr), CancellationToken::new())
        .await
        .unwrap();
    let mut n = 0;
    while itr.try_next().unwrap().is_some() {
        n += 1;
    }
    assert_eq!(n, 2);

    // An empty-matching regex includes series missing the key.
    shard
        .write_points(vec![point(b"cpu", vec![(b"region", b"ap")], 2, vec![("value", FieldValue::Float(4.0))])])
        .await
        .unwrap();
    let expr = Expr::binary(
        BinaryOp::EqRegex,
        Expr::tag_ref("host"),
        Expr::RegexLiteral(regex::Regex::new("^$|^a$").unwrap()),
    );
    let mut itr = shard
        .measurement_series_by_expr(b"cpu", Some(&expr), CancellationToken::new())
        .await
        .unwrap();
    let mut n = 0;
    while itr.try_next().unwrap().is_some() {
        n += 1;
    }
    assert_eq!(n, 2, "host=a plus the hostless series");

    // Field comparisons ride along as residual filters.
    let expr = Expr::binary(
        BinaryOp::And,
        tag_eq("region", "us"),
        Expr::binary(
            BinaryOp::Gt,
            Expr::field_ref("value"),
            Expr::NumberLiteral(1.5),
        ),
    );
    let sets = shard
        .tag_sets(b"cpu", &["host".to_string()], Some(&expr))
        .await
        .unwrap();
    assert_eq!(sets.len(), 2);
    for set in &sets {
        assert_eq!(set.series_keys.len(), 1);
        let filter = set.filters[0].as_ref().expect("residual filter expected");
        assert_eq!(filter.to_string(), "value > 1.5");
    }

    // Invalid operator on a tag is rejected up front.
    let expr = Expr::binary(
        BinaryOp::Gt,
        Expr::tag_ref("host"),
        Expr::StringLiteral("a".to_string()),
    );
    let err = shard
        .measurement_series_by_expr(b"cpu", Some(&expr), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::InvalidPredicate(_))
    ));
}

#[tokio::test]
async fn test_delete_measurement() {
    let dir = tempfile::tempdir().unwrap();
    let (shard, store) = open_shard(dir.as_ref(), options(IndexType::Tsi1, 0)).await;

    shard
        .write_points(vec![
            point(b"cpu", vec![(b"host", b"a")], 1, vec![("v", FieldValue::Float(1.0))]),
            point(b"mem", vec![(b"host", b"a")], 1, vec![("v", FieldValue::Float(1.0))]),
        ])
        .await
        .unwrap();

    shard.delete_measurement(b"cpu").await.unwrap();

    let (names, _) = shard.measurements_by_expr(None).await.unwrap();
    assert_eq!(names, vec![b"mem".to_vec()]);
    assert_eq!(shard.series_n().await.unwrap(), 1);
    assert_eq!(store.point_n(), 1);
    assert!(shard.measurement_fields(b"cpu").await.unwrap().is_none());
}

#[tokio::test]
async fn test_snapshot_stream_restore() {
    let src_dir = tempfile::tempdir().unwrap();
    let (shard, _store) = open_shard(src_dir.as_ref(), options(IndexType::Tsi1, 0)).await;

    for host in [b"a".as_slice(), b"b"] {
        shard
            .write_points(vec![point(
                b"cpu",
                vec![(b"host", host)],
                1,
                vec![("v", FieldValue::Float(1.0))],
            )])
            .await
            .unwrap();
    }

    let mut buf = Vec::new();
    let n = shard.write_to(&mut buf).await.unwrap();
    assert_eq!(n as usize, buf.len());
    assert!(n > 0);

    // Restore into a fresh shard rooted elsewhere.
    let dst_dir = tempfile::tempdir().unwrap();
    let dst_path = dst_dir.as_ref().join("shard");
    let store = Arc::new(MemPointStore::new());
    let restored = Shard::new(
        2,
        dst_path.to_str().unwrap(),
        dst_dir.as_ref().join("wal").to_str().unwrap(),
        "db0",
        "rp0",
        store,
        options(IndexType::Tsi1, 0),
    );
    restored
        .restore(&mut buf.as_slice(), dst_path.to_str().unwrap())
        .await
        .unwrap();
    restored.set_enabled(true);

    assert_eq!(restored.series_n().await.unwrap(), 2);
    let (names, _) = restored.measurements_by_expr(None).await.unwrap();
    assert_eq!(names, vec![b"cpu".to_vec()]);
}

#[tokio::test]
async fn test_inmem_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let opt = options(IndexType::InMem, 0);

    {
        let (shard, _store) = open_shard(dir.as_ref(), opt.clone()).await;
        shard
            .write_points(vec![
                point(b"cpu", vec![(b"host", b"a")], 1, vec![("v", FieldValue::Float(1.0))]),
                point(b"cpu", vec![(b"host", b"b")], 1, vec![("v", FieldValue::Float(2.0))]),
            ])
            .await
            .unwrap();
        assert_eq!(shard.series_n().await.unwrap(), 2);
        shard.close().await.unwrap();
    }

    // The in-memory index rebuilds from the series file on open.
    let (shard, _store) = open_shard(dir.as_ref(), opt).await;
    assert_eq!(shard.series_n().await.unwrap(), 2);
    let (names, ok) = shard
        .measurements_by_expr(Some(&tag_eq("host", "a")))
        .await
        .unwrap();
    assert_eq!(names, vec![b"cpu".to_vec()]);
    assert!(ok);
}
