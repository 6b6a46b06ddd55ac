#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use cmi5_runtime::importer::PackageImporter;
use cmi5_runtime::launch::{LaunchConfig, LaunchManager};
use cmi5_runtime::lrs::{Lrs, SqlLrs};
use cmi5_runtime::packages::PackageRepo;
use cmi5_runtime::routes::AppState;
use cmi5_runtime::storage::FsContentStore;

pub const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<courseStructure xmlns="https://w3id.org/xapi/profiles/cmi5/v1/CourseStructure.xsd">
  <course id="https://example.com/course/sales">
    <title><langstring lang="en-US">Sales Training</langstring></title>
    <description><langstring lang="en-US">Basics and techniques</langstring></description>
  </course>
  <block id="https://example.com/block/basics">
    <title><langstring lang="en-US">Basics</langstring></title>
    <au id="https://example.com/au/intro" moveOn="Completed" launchMethod="OwnWindow">
      <title><langstring lang="en-US">Introduction</langstring></title>
      <url>content/intro/index.html</url>
    </au>
    <au id="https://example.com/au/quiz" moveOn="Passed" masteryScore="0.8">
      <title><langstring lang="en-US">Quiz</langstring></title>
      <url>content/quiz/index.html</url>
    </au>
  </block>
</courseStructure>
"#;

/// Zip `files` (path, contents) in memory.
pub fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
    let raw: Vec<(&str, &[u8])> = files.iter().map(|(p, b)| (*p, b.as_bytes())).collect();
    zip_bytes(&raw)
}

pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut bytes = Vec::new();
    {
        let mut zw = zip::ZipWriter::new(std::io::Cursor::new(&mut bytes));
        let opts = zip::write::FileOptions::default();
        for (path, body) in files {
            zw.start_file(*path, opts).unwrap();
            zw.write_all(body).unwrap();
        }
        zw.finish().unwrap();
    }
    bytes
}

pub fn sample_package() -> Vec<u8> {
    zip_of(&[
        ("cmi5.xml", MANIFEST),
        ("content/intro/index.html", "<html>intro</html>"),
        ("content/quiz/index.html", "<html>quiz</html>"),
    ])
}

pub struct Harness {
    pub state: AppState,
    pub lrs: Arc<SqlLrs>,
    pub data_dir: tempfile::TempDir,
}

pub async fn harness() -> Harness {
    let db = cmi5_runtime::db::connect_in_memory().await.unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let lrs = Arc::new(SqlLrs::new(db.clone()));
    let packages = PackageRepo::new(db);
    let store = Arc::new(FsContentStore::new(data_dir.path()));
    let dyn_lrs: Arc<dyn Lrs> = lrs.clone();
    let state = AppState {
        importer: PackageImporter::new(packages.clone(), store, 10 * 1024 * 1024),
        launcher: LaunchManager::new(
            packages.clone(),
            dyn_lrs.clone(),
            LaunchConfig {
                endpoint: "http://localhost:8081/xapi".into(),
                fetch_base_url: "http://localhost:8081".into(),
                content_base_url: "http://localhost:8081/content".into(),
                actor_home_page: "https://lms.example.com".into(),
                token_ttl: chrono::Duration::minutes(10),
            },
        ),
        packages,
        lrs: dyn_lrs,
    };
    Harness { state, lrs, data_dir }
}
