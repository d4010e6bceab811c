use bytes::Bytes;
use sfdb_catalogue::visit::ListElement;
use sfdb_catalogue::{
    CatalogueWriter, Engine, SerialisationVersion, TocCatalogueReader, TocCatalogueWriter,
};
use sfdb_common::schema::test_support::example_schema;
use sfdb_common::{config::RootConfig, Config, Key, Request, SfdbUri};
use std::path::Path;
use std::sync::Arc;

fn config_for(root: &Path) -> Config {
    Config {
        roots: vec![RootConfig {
            path: root.to_path_buf(),
            endpoint: None,
            bucket: None,
        }],
        ..Config::default()
    }
}

fn engine_for(root: &Path) -> Engine {
    Engine::with_schema(config_for(root), example_schema()).expect("engine")
}

fn full_key(date: &str, step: &str) -> Key {
    Key::from_pairs([
        ("class", "od"),
        ("stream", "oper"),
        ("date", date),
        ("type", "fc"),
        ("levtype", "sfc"),
        ("step", step),
        ("param", "130"),
    ])
}

async fn read_all(engine: &mut Engine, key: &Key) -> Bytes {
    engine
        .retrieve(key)
        .await
        .expect("retrieve")
        .read_all()
        .await
        .expect("read")
}

#[tokio::test]
async fn archive_and_retrieve_round_trip() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut engine = engine_for(root.path());

    let key = full_key("20260801", "0");
    engine
        .archive(&key, Bytes::from_static(b"\xde\xad\xbe\xef"))
        .await
        .expect("archive");
    engine.flush().await.expect("flush");

    let elements = engine
        .list(&Request::new("list"), false)
        .await
        .expect("list");
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].location.length(), 4);

    assert_eq!(read_all(&mut engine, &key).await.as_ref(), b"\xde\xad\xbe\xef");
    engine.close().await.expect("close");
}

#[tokio::test]
async fn masking_an_index_hides_its_fields() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut engine = engine_for(root.path());

    for step in ["0", "6"] {
        engine
            .archive(&full_key("20260801", step), Bytes::from_static(b"data"))
            .await
            .expect("archive");
    }
    engine.flush().await.expect("flush");
    engine.close().await.expect("close");

    // Mask the single index epoch with a CLEAR record.
    let db_key = Key::from_pairs([("class", "od"), ("stream", "oper"), ("date", "20260801")]);
    let reader = TocCatalogueReader::open(root.path(), &db_key).expect("reader");
    let refs: Vec<_> = reader
        .indexes(false)
        .into_iter()
        .map(|l| l.toc_ref.clone())
        .collect();
    assert_eq!(refs.len(), 1);
    {
        let writer = TocCatalogueWriter::create(
            root.path(),
            db_key,
            &Arc::new(example_schema()),
            SerialisationVersion::default(),
            false,
        )
        .expect("writer");
        writer.mask_entries(&refs).expect("mask");
    }

    let engine = engine_for(root.path());
    let elements = engine
        .list(&Request::new("list"), false)
        .await
        .expect("list");
    assert!(elements.is_empty());
}

#[tokio::test]
async fn sub_toc_mount_and_unmount() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut engine = engine_for(root.path());

    // DB1 holds steps 0..5.
    for step in 0..6 {
        engine
            .archive(
                &full_key("20260707", &step.to_string()),
                Bytes::from_static(b"step"),
            )
            .await
            .expect("archive");
    }
    engine.flush().await.expect("flush");
    engine.close().await.expect("close");

    let db1_key = Key::from_pairs([("class", "od"), ("stream", "oper"), ("date", "20260707")]);
    let db2_key = Key::from_pairs([("class", "od"), ("stream", "oper"), ("date", "20260801")]);
    let db1_toc = SfdbUri::file(
        root.path()
            .join(db1_key.values_to_string())
            .join("toc"),
    );
    let varying = std::collections::BTreeSet::from(["date".to_string()]);

    // DB2 mounts DB1.
    let mut writer = TocCatalogueWriter::create(
        root.path(),
        db2_key.clone(),
        &Arc::new(example_schema()),
        SerialisationVersion::default(),
        false,
    )
    .expect("writer");
    writer
        .overlay_db(&db1_key, db1_toc.clone(), &varying, false)
        .await
        .expect("mount");

    let mut list_db2 = Request::new("list");
    list_db2.set("date", ["20260801"]);
    let engine = engine_for(root.path());
    let elements = engine.list(&list_db2, false).await.expect("list");
    assert_eq!(elements.len(), 6);
    // Mounted fields surface under the host's coordinates.
    assert!(elements
        .iter()
        .all(|e: &ListElement| e.key.get("date") == Some("20260801")));

    writer
        .overlay_db(&db1_key, db1_toc, &varying, true)
        .await
        .expect("unmount");
    let elements = engine.list(&list_db2, false).await.expect("list");
    assert!(elements.is_empty());
}

#[tokio::test]
async fn partial_wipe_masks_without_deleting() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut engine = engine_for(root.path());

    // Two indexes (fc and an), each holding steps 0, 6, 12 in one unit.
    for typ in ["fc", "an"] {
        for step in ["0", "6", "12"] {
            let mut key = full_key("20260801", step);
            key.insert("type", typ);
            engine
                .archive(&key, Bytes::from(format!("{typ}-{step}")))
                .await
                .expect("archive");
        }
    }
    engine.flush().await.expect("flush");
    engine.close().await.expect("close");

    let mut engine = engine_for(root.path());
    let mut wipe_request = Request::new("wipe");
    wipe_request.set("step", ["0"]);
    let results = engine
        .wipe(&wipe_request, true, false)
        .await
        .expect("wipe");
    assert_eq!(results.len(), 1);
    let (_, plan) = &results[0];

    // Mixed units are safe: nothing physically deleted.
    assert!(plan.delete_units.is_empty());
    assert_eq!(plan.safe_units.len(), 2);
    assert!(!plan.full);
    assert_eq!(plan.rewrite_epochs.len(), 2);

    let mut step0 = Request::new("list");
    step0.set("step", ["0"]);
    let engine = engine_for(root.path());
    assert!(engine.list(&step0, false).await.expect("list").is_empty());

    let mut step6 = Request::new("list");
    step6.set("step", ["6"]);
    let survivors = engine.list(&step6, false).await.expect("list");
    assert_eq!(survivors.len(), 2);

    // The surviving bytes are still retrievable.
    let mut engine = engine_for(root.path());
    let mut key = full_key("20260801", "6");
    key.insert("type", "an");
    assert_eq!(read_all(&mut engine, &key).await.as_ref(), b"an-6");
}

#[tokio::test]
async fn full_wipe_removes_the_container() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut engine = engine_for(root.path());

    engine
        .archive(&full_key("20260801", "0"), Bytes::from_static(b"bytes"))
        .await
        .expect("archive");
    engine.flush().await.expect("flush");
    engine.close().await.expect("close");

    let db_dir = root.path().join("od,oper,20260801");
    assert!(db_dir.is_dir());

    let mut engine = engine_for(root.path());
    let mut request = Request::new("wipe");
    request.set("date", ["20260801"]);
    let results = engine.wipe(&request, true, false).await.expect("wipe");
    assert_eq!(results.len(), 1);
    assert!(results[0].1.full);
    assert!(!db_dir.exists());
}

#[tokio::test]
async fn full_wipe_refuses_residuals_unless_forced() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut engine = engine_for(root.path());

    engine
        .archive(&full_key("20260801", "0"), Bytes::from_static(b"bytes"))
        .await
        .expect("archive");
    engine.flush().await.expect("flush");
    engine.close().await.expect("close");

    // An unaccounted file inside the DB container.
    let db_dir = root.path().join("od,oper,20260801");
    std::fs::write(db_dir.join("stray.bin"), b"???").expect("write");

    let mut engine = engine_for(root.path());
    let mut request = Request::new("wipe");
    request.set("date", ["20260801"]);
    assert!(engine.wipe(&request, true, false).await.is_err());
    assert!(db_dir.exists());

    // Forcing proceeds.
    let mut engine = engine_for(root.path());
    engine
        .wipe(&request, true, true)
        .await
        .expect("forced wipe");
    assert!(!db_dir.exists());
}

#[tokio::test]
async fn list_deduplicates_by_most_recent_epoch() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut engine = engine_for(root.path());

    let key = full_key("20260801", "0");
    engine
        .archive(&key, Bytes::from_static(b"old"))
        .await
        .expect("archive");
    engine.flush().await.expect("flush");
    engine
        .archive(&key, Bytes::from_static(b"new"))
        .await
        .expect("archive");
    engine.flush().await.expect("flush");
    engine.close().await.expect("close");

    let engine = engine_for(root.path());
    let raw = engine
        .list(&Request::new("list"), false)
        .await
        .expect("list");
    assert_eq!(raw.len(), 2);

    let deduped = engine
        .list(&Request::new("list"), true)
        .await
        .expect("list");
    assert_eq!(deduped.len(), 1);
    assert_eq!(deduped[0].location.length(), 3);

    // Retrieval already resolves to the most recent field.
    let mut engine = engine_for(root.path());
    assert_eq!(read_all(&mut engine, &key).await.as_ref(), b"new");
}

#[tokio::test]
async fn purge_reports_shadowed_epochs() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut engine = engine_for(root.path());

    let key = full_key("20260801", "0");
    engine
        .archive(&key, Bytes::from_static(b"old"))
        .await
        .expect("archive");
    engine.flush().await.expect("flush");
    engine
        .archive(&key, Bytes::from_static(b"new"))
        .await
        .expect("archive");
    engine.flush().await.expect("flush");
    engine.close().await.expect("close");

    let mut engine = engine_for(root.path());
    let report = engine
        .purge(&Request::new("purge"), false)
        .await
        .expect("purge");
    assert_eq!(report.duplicate_fields, 1);
    assert_eq!(report.maskable.len(), 1);

    let report = engine
        .purge(&Request::new("purge"), true)
        .await
        .expect("purge doit");
    assert_eq!(report.duplicate_fields, 1);
    engine.close().await.expect("close");

    // After purging, only the most recent epoch remains visible.
    let engine = engine_for(root.path());
    let raw = engine
        .list(&Request::new("list"), false)
        .await
        .expect("list");
    assert_eq!(raw.len(), 1);
}

#[tokio::test]
async fn stats_and_status_cover_the_tree() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut engine = engine_for(root.path());

    for step in ["0", "6"] {
        engine
            .archive(&full_key("20260801", step), Bytes::from_static(b"12345678"))
            .await
            .expect("archive");
    }
    engine.flush().await.expect("flush");
    engine.close().await.expect("close");

    let engine = engine_for(root.path());
    let stats = engine.stats(&Request::new("stats")).await.expect("stats");
    assert_eq!(stats.databases, 1);
    assert_eq!(stats.indexes, 1);
    assert_eq!(stats.fields, 2);
    assert_eq!(stats.field_bytes, 16);

    let status = engine
        .status(&Request::new("status"))
        .await
        .expect("status");
    assert_eq!(status.databases.len(), 1);
}

#[tokio::test]
async fn move_re_archives_into_another_root() {
    let source_root = tempfile::tempdir().expect("tempdir");
    let dest_root = tempfile::tempdir().expect("tempdir");
    let mut engine = engine_for(source_root.path());

    let key = full_key("20260801", "0");
    engine
        .archive(&key, Bytes::from_static(b"moved-bytes"))
        .await
        .expect("archive");
    engine.flush().await.expect("flush");
    engine.close().await.expect("close");

    let mut engine = engine_for(source_root.path());
    engine
        .move_db(&Request::new("move"), dest_root.path())
        .await
        .expect("move");

    let mut dest_engine = engine_for(dest_root.path());
    assert_eq!(
        read_all(&mut dest_engine, &key).await.as_ref(),
        b"moved-bytes"
    );
}
