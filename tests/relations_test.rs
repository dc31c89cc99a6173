mod helpers;

use helpers::open_trove;
use std::collections::HashSet;
use trove::memory::relations::{Direction, RelationType};
use trove::memory::search::{SearchMode, SearchRequest};
use trove::memory::types::NewMemory;
use trove::TroveError;

#[tokio::test]
async fn cycles_terminate_at_any_depth() {
    let home = tempfile::tempdir().unwrap();
    let trove = open_trove(home.path(), &home.path().join("app"));

    let a = trove.remember(NewMemory::new("node a")).await.unwrap();
    let b = trove.remember(NewMemory::new("node b")).await.unwrap();
    let c = trove.remember(NewMemory::new("node c")).await.unwrap();
    trove.link(&a.id, &b.id, RelationType::RelatedTo, None).await.unwrap();
    trove.link(&b.id, &a.id, RelationType::Contradicts, None).await.unwrap();
    trove.link(&b.id, &c.id, RelationType::RelatedTo, None).await.unwrap();
    trove.link(&c.id, &a.id, RelationType::RelatedTo, None).await.unwrap();

    for depth in [1, 2, 5, 50] {
        let neighbors = trove.related(&a.id, depth).await.unwrap();
        let ids: HashSet<&str> = neighbors.iter().map(|n| n.memory_id.as_str()).collect();
        assert_eq!(ids.len(), neighbors.len(), "a memory was visited twice");
        assert!(!ids.contains(a.id.as_str()));
        assert!(ids.contains(b.id.as_str()));
    }
    assert_eq!(trove.related(&a.id, 50).await.unwrap().len(), 2);
}

#[tokio::test]
async fn deleted_target_leaves_no_dangling_neighbor() {
    let home = tempfile::tempdir().unwrap();
    let trove = open_trove(home.path(), &home.path().join("app"));

    let x = trove.remember(NewMemory::new("new approach")).await.unwrap();
    let y = trove.remember(NewMemory::new("old approach")).await.unwrap();
    trove.link(&x.id, &y.id, RelationType::Supersedes, None).await.unwrap();

    let before = trove.related(&x.id, 1).await.unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].direction, Direction::Outgoing);

    trove.forget(&y.id, true).await.unwrap();
    assert!(trove.related(&x.id, 3).await.unwrap().is_empty());
    assert!(trove.relationships(&x.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn link_validates_endpoints() {
    let home = tempfile::tempdir().unwrap();
    let trove = open_trove(home.path(), &home.path().join("app"));
    let a = trove.remember(NewMemory::new("lonely")).await.unwrap();

    assert!(matches!(
        trove.link(&a.id, &a.id, RelationType::RelatedTo, None).await,
        Err(TroveError::Validation(_))
    ));
    assert!(matches!(
        trove.link(&a.id, "mem_nowhere", RelationType::RelatedTo, None).await,
        Err(TroveError::NotFound { .. })
    ));

    let b = trove.remember(NewMemory::new("company")).await.unwrap();
    assert!(matches!(
        trove.link(&a.id, &b.id, RelationType::RelatedTo, Some(1.5)).await,
        Err(TroveError::Validation(_))
    ));
}

#[tokio::test]
async fn relinking_updates_strength_and_unlink_removes() {
    let home = tempfile::tempdir().unwrap();
    let trove = open_trove(home.path(), &home.path().join("app"));
    let a = trove.remember(NewMemory::new("first")).await.unwrap();
    let b = trove.remember(NewMemory::new("second")).await.unwrap();

    trove.link(&a.id, &b.id, RelationType::DerivedFrom, Some(0.3)).await.unwrap();
    let edge = trove
        .link(&a.id, &b.id, RelationType::DerivedFrom, Some(0.9))
        .await
        .unwrap();
    assert!((edge.strength - 0.9).abs() < 1e-9);
    assert_eq!(trove.relationships(&b.id).await.unwrap().len(), 1);

    assert!(trove.unlink(&a.id, &b.id, RelationType::DerivedFrom).await.unwrap());
    assert!(!trove.unlink(&a.id, &b.id, RelationType::DerivedFrom).await.unwrap());
    assert!(trove.relationships(&a.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn search_expands_through_links() {
    let home = tempfile::tempdir().unwrap();
    let trove = open_trove(home.path(), &home.path().join("app"));
    let hit = trove
        .remember(NewMemory::new("flaky integration test on CI"))
        .await
        .unwrap();
    let linked = trove
        .remember(NewMemory::new("runner image pinned to ubuntu 22.04"))
        .await
        .unwrap();
    trove.link(&hit.id, &linked.id, RelationType::RelatedTo, None).await.unwrap();

    let mut request = SearchRequest::new("flaky", SearchMode::Keyword);
    request.expand_depth = 1;
    let response = trove.search(request).await.unwrap();
    assert_eq!(response.hit_ids(), vec![hit.id]);
    assert_eq!(response.related.len(), 1);
    assert_eq!(response.related[0].memory.id, linked.id);
}
