//! Bundle extraction and staging tests

use std::io::{Cursor, Write};

use shipyard::deploy::bundle::{Bundle, BundleFile};
use shipyard::deploy::stager::{EntryRules, Stager};
use shipyard::errors::ShipyardError;
use shipyard::filesys::dir::Dir;

use crate::support::count_entries;

fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }
    buf.into_inner()
}

#[test]
fn test_zip_with_parent_traversal_is_rejected() {
    let archive = zip_of(&[("app.py", b"ok"), ("../escape.py", b"bad")]);
    let err = Bundle::from_zip(&archive).unwrap_err();
    assert!(matches!(err, ShipyardError::BundleInvalid(_)));
}

#[test]
fn test_zip_with_binary_file_is_rejected() {
    let archive = zip_of(&[("app.py", b"ok"), ("logo.png", &[0xff, 0xfe, 0x00, 0x9f])]);
    let err = Bundle::from_zip(&archive).unwrap_err();
    assert!(matches!(err, ShipyardError::BundleInvalid(_)));
}

#[tokio::test]
async fn test_staged_tree_matches_bundle() {
    let root = tempfile::tempdir().unwrap();
    let stager = Stager::new(Dir::new(root.path()), EntryRules::default());
    let archive = zip_of(&[
        ("main.py", b"print('main')"),
        ("requirements.txt", b"streamlit\n"),
        ("pages/1_report.py", b"print('report')"),
        ("data/sample.csv", b"a,b\n1,2\n"),
    ]);
    let bundle = Bundle::from_zip(&archive).unwrap();

    let staged = stager.stage(&bundle, "deploy").await.unwrap();
    assert_eq!(staged.entry, "main.py");

    for file in bundle.files() {
        let on_disk = std::fs::read_to_string(staged.dir.path().join(&file.path)).unwrap();
        assert_eq!(on_disk, file.content, "content of {}", file.path);
    }
    assert_eq!(count_entries(staged.dir.path()), 4);
}

#[tokio::test]
async fn test_each_stage_gets_its_own_directory() {
    let root = tempfile::tempdir().unwrap();
    let stager = Stager::new(Dir::new(root.path()), EntryRules::default());
    let bundle = Bundle::new(vec![BundleFile::new("app.py", "x")]);

    let a = stager.stage(&bundle, "deploy").await.unwrap();
    let b = stager.stage(&bundle, "deploy").await.unwrap();
    assert_ne!(a.dir.path(), b.dir.path());
    assert_eq!(count_entries(root.path()), 2);
}

#[tokio::test]
async fn test_bundle_without_entry_leaves_nothing_behind() {
    let root = tempfile::tempdir().unwrap();
    let stager = Stager::new(Dir::new(root.path()), EntryRules::default());
    let bundle = Bundle::new(vec![
        BundleFile::new("README.md", "docs"),
        BundleFile::new("lib/app.py", "nested is not an entry"),
    ]);

    let err = stager.stage(&bundle, "deploy").await.unwrap_err();
    assert!(matches!(err, ShipyardError::BundleInvalid(_)));
    assert_eq!(count_entries(root.path()), 0);
}

#[tokio::test]
async fn test_absolute_path_is_rejected_before_writing() {
    let root = tempfile::tempdir().unwrap();
    let stager = Stager::new(Dir::new(root.path()), EntryRules::default());
    let bundle = Bundle::new(vec![
        BundleFile::new("app.py", "x"),
        BundleFile::new("/etc/passwd", "nope"),
    ]);

    let err = stager.stage(&bundle, "deploy").await.unwrap_err();
    assert!(matches!(err, ShipyardError::BundleInvalid(_)));
    assert_eq!(count_entries(root.path()), 0);
}
