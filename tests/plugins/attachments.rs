use cairn::core::config::StoreOptions;
use cairn::core::error::CairnError;
use cairn::core::identity::Identity;
use cairn::core::store::Store;
use cairn::core::sync::SyncContext;
use cairn::plugins::attachments::{attach, list_attachments, remove_attachment};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn test_store(dir: &Path, options: StoreOptions) -> Store {
    Store::open(
        dir.join("Countries.json"),
        options,
        Identity::for_machine("alpha"),
        SyncContext::isolated(),
    )
    .unwrap()
}

#[test]
fn test_attach_copies_into_store_folder() {
    let pit = tempdir().unwrap();
    let outside = tempdir().unwrap();
    let source = outside.path().join("Notes.pdf");
    fs::write(&source, b"%PDF-1.7").unwrap();

    let store = test_store(pit.path(), StoreOptions::default());
    let attachment = attach(&store, &source).unwrap();
    assert_eq!(attachment.name, "Notes.pdf");
    assert_eq!(attachment.size, 8);
    assert!(pit.path().join("Notes.pdf").exists());
    assert!(source.exists());
}

#[test]
fn test_attach_inside_folder_is_left_in_place() {
    let pit = tempdir().unwrap();
    let nested = pit.path().join("images");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("flag.png"), b"png").unwrap();

    let store = test_store(pit.path(), StoreOptions::default());
    let attachment = attach(&store, &nested.join("flag.png")).unwrap();
    assert_eq!(attachment.name, "images/flag.png");
    assert!(!pit.path().join("flag.png").exists());
}

#[test]
fn test_unsupported_kinds_are_rejected() {
    let pit = tempdir().unwrap();
    let source = pit.path().join("script.sh");
    fs::write(&source, b"echo").unwrap();
    let store = test_store(pit.path(), StoreOptions::default());
    assert!(matches!(
        attach(&store, &source),
        Err(CairnError::ValidationError(_))
    ));
    assert!(matches!(
        remove_attachment(&store, "script.sh"),
        Err(CairnError::ValidationError(_))
    ));
}

#[test]
fn test_list_is_recursive_and_ignores_store_files() {
    let pit = tempdir().unwrap();
    let mut store = test_store(pit.path(), StoreOptions::default());
    store
        .set_property("Finland", &serde_json::json!({"v": 1}))
        .unwrap();
    store.save(None, false).unwrap();
    fs::create_dir_all(pit.path().join("docs/2024")).unwrap();
    fs::write(pit.path().join("docs/2024/report.docx"), b"doc").unwrap();
    fs::write(pit.path().join("clip.mov"), b"mov").unwrap();
    fs::write(pit.path().join("readme.txt"), b"txt").unwrap();

    let names: Vec<String> = list_attachments(&store)
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec!["clip.mov", "docs/2024/report.docx"]);
}

#[test]
fn test_remove_attachment() {
    let pit = tempdir().unwrap();
    fs::write(pit.path().join("sheet.xlsm"), b"x").unwrap();
    let store = test_store(pit.path(), StoreOptions::default());
    assert!(remove_attachment(&store, "sheet.xlsm").unwrap());
    assert!(!remove_attachment(&store, "sheet.xlsm").unwrap());
    assert!(matches!(
        remove_attachment(&store, "../escape.pdf"),
        Err(CairnError::ValidationError(_))
    ));
}

#[test]
fn test_read_only_store_cannot_change_attachments() {
    let pit = tempdir().unwrap();
    let source = pit.path().join("song.ogg");
    fs::write(&source, b"ogg").unwrap();
    let store = test_store(pit.path(), StoreOptions::read_only());
    assert!(matches!(
        attach(&store, &source),
        Err(CairnError::IllegalWrite(_))
    ));
    assert!(matches!(
        remove_attachment(&store, "song.ogg"),
        Err(CairnError::IllegalWrite(_))
    ));
    assert_eq!(list_attachments(&store).unwrap().len(), 1);
}
