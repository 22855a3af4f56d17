use cairn::core::change::{self, ChangeFileName};
use cairn::core::codec;
use cairn::core::config::{self, StoreOptions};
use cairn::core::error::CairnError;
use cairn::core::flag::FlagFile;
use cairn::core::history::RecordHistory;
use cairn::core::identity::Identity;
use cairn::core::record::Record;
use cairn::core::store::Store;
use cairn::core::sync::SyncContext;
use cairn::core::time;
use cairn::core::token::TimestampedToken;
use serde_json::json;
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn stamp(s: &str) -> chrono::DateTime<chrono::Utc> {
    time::parse_iso(s).unwrap()
}

#[test]
fn ticks_match_dotnet_epoch() {
    assert_eq!(
        time::to_ticks(&stamp("1970-01-01T00:00:00Z")),
        621_355_968_000_000_000
    );
    assert_eq!(time::to_ticks(&time::epoch()), 621_355_968_000_000_000);
    assert_eq!(time::from_ticks(0), Some(stamp("0001-01-01T00:00:00Z")));
    let t = stamp("2024-05-06T07:08:09.1234567Z");
    assert_eq!(time::from_ticks(time::to_ticks(&t)), Some(t));
    assert_eq!(time::format_iso(&t), "2024-05-06T07:08:09.123456700Z");
}

#[test]
fn token_lines_parse_with_and_without_time() {
    let token: TimestampedToken = "alpha|2020-01-01T00:00:00Z".parse().unwrap();
    assert_eq!(token.value, "alpha");
    assert_eq!(token.time, stamp("2020-01-01T00:00:00Z"));
    assert_eq!(token.to_string(), "alpha|2020-01-01T00:00:00Z");

    let bare: TimestampedToken = "beta".parse().unwrap();
    assert_eq!(bare.value, "beta");

    assert!("gamma|yesterday".parse::<TimestampedToken>().is_err());
}

#[test]
fn stored_documents_keep_reserved_and_open_fields() {
    let record = Record::from_document(json!({
        "Name": "Finland",
        "Modified": "2020-01-01T00:00:00Z",
        "Deleted": false,
        "Note": null,
        "capital": "Helsinki",
        "languages": ["fi", "sv"]
    }))
    .unwrap();
    assert_eq!(record.note(), "");
    assert!(!record.is_dirty());
    let doc = record.to_document().unwrap();
    assert_eq!(doc["Name"], json!("Finland"));
    assert_eq!(doc["Modified"], json!("2020-01-01T00:00:00Z"));
    assert_eq!(doc["languages"], json!(["fi", "sv"]));
    assert!(doc.get("dirty").is_none());

    assert!(matches!(
        Record::from_document(json!(["Finland"])),
        Err(CairnError::FormatError(_))
    ));
}

#[test]
fn record_merge_refuses_other_names() {
    let mut finland = Record::with_timestamp("Finland", stamp("2020-01-01T00:00:00Z"));
    let sweden = Record::with_timestamp("Sweden", stamp("2021-01-01T00:00:00Z"));
    assert!(matches!(
        finland.merge(&sweden),
        Err(CairnError::NameMismatch { .. })
    ));
}

#[test]
fn sharpness_treats_close_versions_as_equal() {
    let a = Record::with_timestamp("Finland", stamp("2020-01-01T00:00:00Z"));
    let b = Record::with_timestamp("Finland", stamp("2020-01-01T00:00:00.0000005Z"));
    assert!(!a.equals(&b, 0));
    assert!(a.equals(&b, 10));

    let mut history = RecordHistory::new("Finland", 5, 10);
    assert!(history.push(a, true));
    assert!(!history.push(b, true));
}

#[test]
fn legacy_flat_file_is_rejected_on_open() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("Legacy.json");
    fs::write(&path, r#"[{"Name":"Finland","Modified":"2020-01-01T00:00:00Z"}]"#).unwrap();
    let err = Store::open(
        &path,
        StoreOptions::default(),
        Identity::for_machine("alpha"),
        SyncContext::isolated(),
    )
    .unwrap_err();
    assert!(matches!(err, CairnError::FormatError(_)));
}

#[test]
fn canonical_file_round_trips_histories() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("Countries.json");
    let text = r#"[
        [{"Name":"Finland","Modified":"2020-01-01T00:00:00Z","v":1},
         {"Name":"Finland","Modified":"2020-02-01T00:00:00Z","v":2}],
        [{"Name":"Sweden","Modified":"2020-01-01T00:00:00Z","Deleted":true,"Note":"gone"}]
    ]"#;
    fs::write(&path, text).unwrap();

    let mut store = Store::open(
        &path,
        StoreOptions::default(),
        Identity::for_machine("alpha"),
        SyncContext::isolated(),
    )
    .unwrap();
    assert_eq!(store.history("Finland").unwrap().len(), 2);
    assert_eq!(store.get("Finland").unwrap().get("v"), Some(&json!(2)));
    assert!(store.get("Sweden").is_none());
    assert!(store.contains("Sweden", true));
    assert!(!store.is_dirty());

    store.store(true).unwrap();
    let stacks = codec::decode(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(stacks.len(), 2);
    assert_eq!(stacks[0].len(), 2);
    assert_eq!(stacks[1][0].note(), "gone");
}

#[test]
fn history_cap_is_honored_on_load() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("Countries.json");
    let versions: Vec<_> = (1..=4)
        .map(|i| {
            let modified = format!("2020-01-0{}T00:00:00Z", i);
            json!({"Name": "Finland", "Modified": modified, "v": i})
        })
        .collect();
    fs::write(&path, serde_json::to_string(&vec![versions]).unwrap()).unwrap();
    let options = StoreOptions {
        max_count: 2,
        ..StoreOptions::default()
    };
    let store = Store::open(
        &path,
        options,
        Identity::for_machine("alpha"),
        SyncContext::isolated(),
    )
    .unwrap();
    let values: Vec<_> = store
        .values_over_time("Finland", "v")
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    assert_eq!(values, vec![json!(3), json!(4)]);
}

#[test]
fn config_file_drives_store_options() {
    let tmp = tempdir().unwrap();
    fs::write(
        config::config_path(tmp.path()),
        "ignore_case = true\npretty = true\n",
    )
    .unwrap();
    let options = config::load_options(tmp.path()).unwrap();
    let mut store = Store::open(
        tmp.path().join("Countries.json"),
        options,
        Identity::for_machine("alpha"),
        SyncContext::isolated(),
    )
    .unwrap();
    store.set_property("Finland", &json!({"v": 1})).unwrap();
    assert!(store.get("FINLAND").is_some());
    store.save(None, false).unwrap();
    assert!(fs::read_to_string(store.path()).unwrap().contains('\n'));
}

#[test]
fn change_file_names_carry_version_and_machine() {
    let record = Record::with_timestamp("Finland", stamp("2020-01-01T00:00:00Z"));
    let name = ChangeFileName::for_record(&record, "beta");
    assert_eq!(name.ticks, record.modified_ticks());
    assert_eq!(
        ChangeFileName::parse(&name.to_string()),
        Some(name.clone())
    );
    assert!(change::SETTLE_WINDOW.as_secs() == 600);
}

#[test]
fn flag_updates_are_serialized_within_a_process() {
    let tmp = tempdir().unwrap();
    let sync = SyncContext::isolated();
    let dir = tmp.path().to_path_buf();
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let dir = dir.clone();
            let sync = sync.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let identity = Identity::new("alpha", format!("worker:{}", i));
                let flag = FlagFile::process(&dir, &identity, &sync, time::epoch()).unwrap();
                barrier.wait();
                flag.update(None, None).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let line = fs::read_to_string(dir.join("alpha.flag")).unwrap();
    let token: TimestampedToken = line.trim().parse().unwrap();
    assert!(token.value.starts_with("worker:"));
}

#[test]
fn persisting_indicator_is_clear_after_failed_load() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("Countries.json");
    let mut store = Store::open(
        &path,
        StoreOptions::default(),
        Identity::for_machine("alpha"),
        SyncContext::isolated(),
    )
    .unwrap();
    let indicator = store.persisting_indicator();
    fs::write(&path, "{ broken").unwrap();
    assert!(store.load().is_err());
    assert!(!store.is_persisting());
    assert!(!indicator.load(std::sync::atomic::Ordering::SeqCst));
}
