mod helpers;

use std::sync::Arc;

use helpers::{request, test_config, test_service};
use memkeep::db::Store;
use memkeep::embedding::EmbeddingService;
use memkeep::memory::types::{Category, Importance, LinkType, ListFilter, MemoryUpdate};
use memkeep::service::{MemoryService, WriteRequest};
use tempfile::TempDir;

/// A second service over the same memory root but an empty database file.
fn fresh_service(tmp: &TempDir) -> MemoryService {
    let mut config = test_config(tmp);
    config.storage.db_file = "rebuilt.db".into();
    let store = Store::open(&config).unwrap();
    MemoryService::with_parts(config, store, Arc::new(EmbeddingService::disabled()))
}

#[tokio::test]
async fn write_produces_markdown_with_front_matter() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    let m = svc
        .write(WriteRequest {
            category: Some(Category::Architecture),
            importance: Some(Importance::High),
            content: Some("Refresh tokens rotate on every use.".into()),
            ..request("JWT Authentication", "Use 15-min access tokens", &["auth", "jwt"])
        })
        .await
        .unwrap();

    let path = svc.memory_root().join("exports/architecture/mem-001-jwt-authentication.md");
    assert_eq!(m.export_path.as_deref(), Some("exports/architecture/mem-001-jwt-authentication.md"));
    let text = std::fs::read_to_string(path).unwrap();
    assert!(text.starts_with("---\n"));
    assert!(text.contains("id: mem-001"));
    assert!(text.contains("importance: high"));
    assert!(text.contains("# JWT Authentication"));
    assert!(text.contains("## Summary\n\nUse 15-min access tokens"));
    assert!(text.contains("## Details\n\nRefresh tokens rotate on every use."));
}

#[tokio::test]
async fn details_are_omitted_when_content_equals_summary() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    let m = svc.write(request("Short", "Only a summary", &[])).await.unwrap();

    let text = std::fs::read_to_string(svc.memory_root().join(m.export_path.unwrap())).unwrap();
    assert!(!text.contains("## Details"));
}

#[tokio::test]
async fn category_change_moves_the_file() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    let m = svc.write(request("Retry policy", "Linear backoff", &[])).await.unwrap();
    let old_path = svc.memory_root().join(m.export_path.unwrap());
    assert!(old_path.starts_with(svc.memory_root().join("exports/patterns")));

    let m = svc
        .update(
            &m.id,
            MemoryUpdate {
                category: Some(Category::Implementation),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!old_path.exists());
    assert!(svc.memory_root().join(m.export_path.unwrap()).exists());
}

#[tokio::test]
async fn archive_moves_file_into_archive_dir() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    let m = svc.write(request("Old idea", "Superseded", &[])).await.unwrap();
    let active_path = svc.memory_root().join(m.export_path.unwrap());

    let archived = svc.archive(&m.id).unwrap();
    assert!(archived.archived);
    assert_eq!(archived.export_path.as_deref(), Some("archive/mem-001-old-idea.md"));
    assert!(!active_path.exists());
    assert!(svc.memory_root().join("archive/mem-001-old-idea.md").exists());
}

#[tokio::test]
async fn rebuild_restores_records_links_and_archive_state() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    let a = svc
        .write(WriteRequest {
            category: Some(Category::Architecture),
            ..request("JWT Authentication", "Use 15-min access tokens", &["auth", "jwt"])
        })
        .await
        .unwrap();
    let b = svc.write(request("Token refresh race", "Two tabs refresh at once", &["auth"])).await.unwrap();
    let c = svc.write(request("Old session cookies", "Replaced by JWT", &[])).await.unwrap();
    svc.link(&b.id, &a.id, LinkType::Implements).unwrap();
    svc.archive(&c.id).unwrap();
    svc.get(&a.id).unwrap();
    svc.get(&a.id).unwrap();
    svc.export_all().unwrap();

    let rebuilt = fresh_service(&tmp);
    let report = rebuilt.rebuild().await.unwrap();
    assert_eq!(report.imported.len(), 3);
    assert_eq!(report.archived, 1);
    assert!(report.failed.is_empty());
    assert_eq!(report.next_id, Some(4));

    let all = rebuilt
        .list(&ListFilter {
            include_archived: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(all.len(), 3);

    let a2 = rebuilt.list(&ListFilter::default()).unwrap().into_iter().find(|m| m.id == a.id).unwrap();
    assert_eq!(a2.title, a.title);
    assert_eq!(a2.category, Category::Architecture);
    assert_eq!(a2.tags, vec!["auth", "jwt"]);
    assert_eq!(a2.created_at, a.created_at);
    assert_eq!(a2.access_count, 2);

    let b2 = rebuilt.get(&b.id).unwrap();
    assert!(b2
        .links
        .iter()
        .any(|l| l.target_id == a.id && l.link_type == LinkType::Implements));

    let c2 = rebuilt.get(&c.id).unwrap();
    assert!(c2.archived);

    let next = rebuilt.write(request("After rebuild", "continues numbering", &[])).await.unwrap();
    assert_eq!(next.id, "mem-004");
}

#[tokio::test]
async fn rebuild_skips_malformed_files() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    svc.write(request("Good", "fine", &[])).await.unwrap();
    std::fs::write(svc.memory_root().join("exports/patterns/garbage.md"), "no front matter here").unwrap();

    let rebuilt = fresh_service(&tmp);
    let report = rebuilt.rebuild().await.unwrap();
    assert_eq!(report.imported, vec!["mem-001"]);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].path.ends_with("garbage.md"));
}

#[tokio::test]
async fn rebuild_over_existing_store_updates_in_place() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    let m = svc.write(request("Cache", "LRU with 1000 entries", &["cache"])).await.unwrap();
    let path = svc.memory_root().join(m.export_path.unwrap());
    let edited = std::fs::read_to_string(&path).unwrap().replace("LRU with 1000 entries", "LFU with 500 entries");
    std::fs::write(&path, edited).unwrap();

    let report = svc.rebuild().await.unwrap();
    assert_eq!(report.imported, vec![m.id.clone()]);
    let reloaded = svc.get(&m.id).unwrap();
    assert_eq!(reloaded.summary, "LFU with 500 entries");
    assert_eq!(svc.stats().unwrap().total, 1);
}

#[tokio::test]
async fn delete_removes_export_file() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    let m = svc.write(request("Temporary", "to be deleted", &[])).await.unwrap();
    let path = svc.memory_root().join(m.export_path.clone().unwrap());
    assert!(path.exists());

    svc.delete(&m.id).unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn cleared_content_survives_rebuild() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    let m = svc
        .write(WriteRequest {
            content: Some("Longer explanation".into()),
            ..request("Title", "The summary", &[])
        })
        .await
        .unwrap();
    let cleared = svc
        .update(
            &m.id,
            MemoryUpdate {
                content: Some(String::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cleared.content, "The summary");

    let rebuilt = fresh_service(&tmp);
    rebuilt.rebuild().await.unwrap();
    assert_eq!(rebuilt.get(&m.id).unwrap().content, cleared.content);
}

#[tokio::test]
async fn links_removed_from_file_are_dropped_on_rebuild() {
    let tmp = TempDir::new().unwrap();
    let svc = test_service(&tmp);
    let a = svc.write(request("Session store", "Redis backed", &[])).await.unwrap();
    let b = svc.write(request("Redis outage", "Failover took 40s", &[])).await.unwrap();
    let linked = svc.link(&a.id, &b.id, LinkType::Related).unwrap();
    assert_eq!(linked.target_id, b.id);

    let path = svc.memory_root().join(svc.get(&a.id).unwrap().export_path.unwrap());
    let text = std::fs::read_to_string(&path).unwrap();
    let edited = text.replace(&format!("\n## Related\n\n- {}\n", b.id), "");
    assert_ne!(edited, text);
    std::fs::write(&path, edited).unwrap();

    svc.rebuild().await.unwrap();
    assert!(svc.get(&a.id).unwrap().links.is_empty());
}
