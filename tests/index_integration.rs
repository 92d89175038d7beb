//! End-to-end behavior of the incremental index: coordinator, store, resolver and queries
//! working together on a real directory.

use filetime::{set_file_mtime, FileTime};
use std::{fs, path::PathBuf, time::Duration};
use typst_oxide::{
    coordinator::{Phase, UpdateOutcome},
    diagnostic::DiagnosticKind,
    event::{FileEvent, IndexEvent, PathOp},
    query::RefTarget,
    resolver::{LabelResolution, Resolution},
};

mod common;
use common::{alpha_beta, init_logging, Notes};

fn resolves_to(resolution: &Resolution, expected: &PathBuf) -> bool {
    matches!(resolution, Resolution::File { path, .. } if path == expected)
}

#[tokio::test]
async fn test_alpha_beta_links_and_deletion() {
    init_logging();
    let notes = Notes::new();
    let (a, b) = alpha_beta(&notes);
    let (coordinator, query) = notes.open(None).await;
    let summary = coordinator.scan(false).await.unwrap();
    assert_eq!(summary.indexed, 2);

    let forward = query.forward_links(&a).await.unwrap();
    assert_eq!(forward.len(), 1);
    assert!(resolves_to(&forward[0].resolution, &b));
    let backlinks = query.backlinks(&b).await.unwrap();
    assert_eq!(backlinks.len(), 1);
    assert_eq!(backlinks[0].source, a);

    notes.remove(&b);
    let outcomes = coordinator
        .handle_event(FileEvent::Removed(b.clone()))
        .await
        .unwrap();
    assert_eq!(outcomes, vec![UpdateOutcome::Removed]);

    let forward = query.forward_links(&a).await.unwrap();
    assert_eq!(forward.len(), 1);
    assert_eq!(forward[0].resolution, Resolution::Unresolved);
    assert!(query.backlinks(&b).await.is_none());
    assert_eq!(coordinator.phase(&b).await, Phase::Unseen);

    let diagnostics = query.diagnostics(&a).await.unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].kind, DiagnosticKind::BrokenReference);
}

#[tokio::test]
async fn test_title_change_flips_backlinks() {
    init_logging();
    let notes = Notes::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let (a, b) = alpha_beta(&notes);
    let c = notes.write("c.typ", "Waiting for [[Gamma]].\n");
    let (coordinator, query) = notes.open(Some(tx)).await;
    coordinator.scan(false).await.unwrap();
    while rx.try_recv().is_ok() {}

    assert_eq!(
        query.forward_links(&c).await.unwrap()[0].resolution,
        Resolution::Unresolved
    );

    notes.write("b.typ", "#meta(title: \"Gamma\")\n\n= Beta\n");
    coordinator
        .handle_event(FileEvent::Modified(b.clone()))
        .await
        .unwrap();

    // The old title no longer resolves, the new one does
    assert_eq!(
        query.forward_links(&a).await.unwrap()[0].resolution,
        Resolution::Unresolved
    );
    assert!(resolves_to(
        &query.forward_links(&c).await.unwrap()[0].resolution,
        &b
    ));
    let backlinks = query.backlinks(&b).await.unwrap();
    assert_eq!(backlinks.len(), 1);
    assert_eq!(backlinks[0].source, c);

    let events: Vec<IndexEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert!(events.contains(&IndexEvent::ReferencesInvalidated {
        sources: vec![a.clone(), c.clone()]
    }));
}

#[tokio::test]
async fn test_reparse_of_unchanged_content_is_idempotent() {
    init_logging();
    let notes = Notes::new();
    let (a, b) = alpha_beta(&notes);
    let (coordinator, query) = notes.open(None).await;
    coordinator.scan(false).await.unwrap();

    let before = (
        query.forward_links(&a).await,
        query.backlinks(&b).await,
        query.metadata(None).await.unwrap(),
        query.labels(&b).await,
        query.all_diagnostics().await.unwrap(),
        query.file_info(&a).await.unwrap().unwrap(),
    );

    coordinator
        .handle_event(FileEvent::Modified(a.clone()))
        .await
        .unwrap();
    coordinator
        .handle_event(FileEvent::Modified(b.clone()))
        .await
        .unwrap();

    let after = (
        query.forward_links(&a).await,
        query.backlinks(&b).await,
        query.metadata(None).await.unwrap(),
        query.labels(&b).await,
        query.all_diagnostics().await.unwrap(),
        query.file_info(&a).await.unwrap().unwrap(),
    );
    assert_eq!(before.0, after.0);
    assert_eq!(before.1, after.1);
    assert_eq!(before.2, after.2);
    assert_eq!(before.3, after.3);
    assert_eq!(before.4, after.4);
    let (old, new) = (before.5, after.5);
    assert_eq!(old.content_hash, new.content_hash);
    assert_eq!(old.created_at, new.created_at);
    assert_eq!(old.modified_at, new.modified_at);
    assert_eq!(old.scan_issues, new.scan_issues);
}

#[tokio::test]
async fn test_duplicate_labels_produce_one_diagnostic() {
    init_logging();
    let notes = Notes::new();
    let a = notes.write("a.typ", "<math>\n$x$ <math>\n$y$ <math>\n$z$ <math>\n");
    let (coordinator, query) = notes.open(None).await;
    coordinator.scan(false).await.unwrap();

    let duplicates: Vec<_> = query
        .diagnostics(&a)
        .await
        .unwrap()
        .into_iter()
        .filter(|d| d.kind == DiagnosticKind::DuplicateLabel)
        .collect();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].position.map(|p| p.line), Some(2));
}

#[tokio::test]
async fn test_label_removal_flips_reference() {
    init_logging();
    let notes = Notes::new();
    let a = notes.write("a.typ", "As shown in [[other:math]].\n");
    let other = notes.write("other.typ", "$ e = m c^2 $ <math>\n");
    let unrelated = notes.write("unrelated.typ", "= Unrelated\n");
    let (coordinator, query) = notes.open(None).await;
    coordinator.scan(false).await.unwrap();

    assert!(matches!(
        query.forward_links(&a).await.unwrap()[0].resolution,
        Resolution::File {
            label: Some(LabelResolution::Found { is_implicit: false, .. }),
            ..
        }
    ));
    assert_eq!(
        query
            .references_to(&RefTarget::Label {
                file: other.clone(),
                name: "math".to_string()
            })
            .await
            .unwrap()
            .len(),
        1
    );
    let unrelated_before = query.file_info(&unrelated).await.unwrap();

    notes.write("other.typ", "$ e = m c^2 $\n");
    coordinator
        .handle_event(FileEvent::Modified(other.clone()))
        .await
        .unwrap();

    let forward = query.forward_links(&a).await.unwrap();
    assert_eq!(
        forward[0].resolution,
        Resolution::File {
            path: other.clone(),
            label: Some(LabelResolution::Missing)
        }
    );
    let kinds: Vec<DiagnosticKind> = query
        .diagnostics(&a)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.kind)
        .collect();
    assert_eq!(kinds, vec![DiagnosticKind::MissingLabel]);
    assert_eq!(query.file_info(&unrelated).await.unwrap(), unrelated_before);
}

#[tokio::test]
async fn test_out_of_order_commits_keep_latest_event() {
    init_logging();
    let notes = Notes::new();
    let a = notes.write("a.typ", "[[first]]");
    let (coordinator, query) = notes.open(None).await;

    let older = coordinator.begin(&a, PathOp::Parse, true).unwrap();
    notes.write("a.typ", "[[second]]");
    let newer = coordinator.begin(&a, PathOp::Parse, true).unwrap();

    // The newer event commits first; the older one must not overwrite it
    assert_eq!(
        coordinator.process(newer).await.unwrap(),
        UpdateOutcome::Indexed { revision: 2 }
    );
    assert_eq!(
        coordinator.process(older).await.unwrap(),
        UpdateOutcome::Superseded { revision: 1 }
    );
    let forward = query.forward_links(&a).await.unwrap();
    assert_eq!(forward.len(), 1);
    assert_eq!(forward[0].target, "second");

    // A removal registered after a parse wins even if the parse is processed last
    let parse = coordinator.begin(&a, PathOp::Parse, true).unwrap();
    let remove = coordinator.begin(&a, PathOp::Remove, true).unwrap();
    assert_eq!(coordinator.process(remove).await.unwrap(), UpdateOutcome::Removed);
    assert_eq!(
        coordinator.process(parse).await.unwrap(),
        UpdateOutcome::Superseded { revision: 3 }
    );
    assert!(query.forward_links(&a).await.is_none());
}

#[tokio::test]
async fn test_scan_uses_mtime_to_skip_unchanged_notes() {
    init_logging();
    let notes = Notes::new();
    let a = notes.write("a.typ", "[[x]]");
    let t0 = FileTime::from_unix_time(1_600_000_000, 0);
    set_file_mtime(&a, t0).unwrap();
    let (coordinator, query) = notes.open(None).await;
    assert_eq!(coordinator.scan(false).await.unwrap().indexed, 1);

    // Same mtime: the scan trusts the cache
    notes.write("a.typ", "[[y]]");
    set_file_mtime(&a, t0).unwrap();
    let summary = coordinator.scan(false).await.unwrap();
    assert_eq!((summary.indexed, summary.skipped), (0, 1));
    assert_eq!(query.forward_links(&a).await.unwrap()[0].target, "x");

    set_file_mtime(&a, FileTime::from_unix_time(1_600_000_060, 0)).unwrap();
    assert_eq!(coordinator.scan(false).await.unwrap().indexed, 1);
    assert_eq!(query.forward_links(&a).await.unwrap()[0].target, "y");

    assert_eq!(coordinator.scan(true).await.unwrap().indexed, 1);
}

#[tokio::test]
async fn test_parse_failure_is_retained_then_recovered() {
    init_logging();
    let notes = Notes::new();
    let (a, b) = alpha_beta(&notes);
    let (coordinator, query) = notes.open(None).await;
    coordinator.scan(false).await.unwrap();

    notes.write("a.typ", "#meta(title: \"Alpha)\n\nSee [[Beta]] and [[Gamma]].\n");
    let outcomes = coordinator
        .handle_event(FileEvent::Modified(a.clone()))
        .await
        .unwrap();
    assert!(matches!(outcomes[0], UpdateOutcome::ParseFailed { .. }));
    assert_eq!(coordinator.phase(&a).await, Phase::Stale);

    // Last good snapshot plus a staleness diagnostic
    assert_eq!(query.forward_links(&a).await.unwrap().len(), 1);
    assert_eq!(query.backlinks(&b).await.unwrap().len(), 1);
    let diagnostics = query.diagnostics(&a).await.unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].kind, DiagnosticKind::ParseFailure);
    assert!(diagnostics[0].message.contains("line 1"));

    // A failing note is re-parsed by the scan even though its mtime is cached
    assert_eq!(coordinator.scan(false).await.unwrap().failed, 1);

    notes.write("a.typ", "#meta(title: \"Alpha\")\n\nSee [[Beta]] and [[Gamma]].\n");
    coordinator
        .handle_event(FileEvent::Modified(a.clone()))
        .await
        .unwrap();
    assert_eq!(coordinator.phase(&a).await, Phase::Indexed);
    assert_eq!(query.forward_links(&a).await.unwrap().len(), 2);
    let kinds: Vec<DiagnosticKind> = query
        .diagnostics(&a)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.kind)
        .collect();
    assert_eq!(kinds, vec![DiagnosticKind::BrokenReference]);
}

#[tokio::test]
async fn test_first_parse_failure_still_creates_note() {
    init_logging();
    let notes = Notes::new();
    let broken = notes.write("broken.typ", "#meta(title: \"x\"\n");
    let (coordinator, query) = notes.open(None).await;
    let summary = coordinator.scan(false).await.unwrap();
    assert_eq!(summary.failed, 1);

    assert_eq!(query.forward_links(&broken).await, Some(Vec::new()));
    let info = query.file_info(&broken).await.unwrap().unwrap();
    assert!(info.parse_error.is_some());
    assert!(info.last_parsed.is_none());
}

#[tokio::test]
async fn test_index_survives_restart() {
    init_logging();
    let notes = Notes::new();
    let (a, b) = alpha_beta(&notes);
    {
        let (coordinator, _query) = notes.open(None).await;
        coordinator.scan(false).await.unwrap();
        coordinator.store().close().await;
    }

    let (coordinator, query) = notes.open(None).await;
    assert!(!coordinator.store().rebuilt());
    // Served straight from the cache, before any scan
    assert_eq!(query.backlinks(&b).await.unwrap()[0].source, a);
    assert_eq!(coordinator.phase(&a).await, Phase::Indexed);
    assert_eq!(coordinator.scan(false).await.unwrap().skipped, 2);
}

#[tokio::test]
async fn test_corrupt_cache_is_rebuilt_by_full_scan() {
    init_logging();
    let notes = Notes::new();
    let (a, b) = alpha_beta(&notes);
    fs::write(notes.path(".pkm-cache.db"), vec![b'x'; 4096]).unwrap();

    let (coordinator, query) = notes.open(None).await;
    assert!(coordinator.store().rebuilt());
    assert_eq!(coordinator.scan(false).await.unwrap().indexed, 2);
    assert!(resolves_to(
        &query.forward_links(&a).await.unwrap()[0].resolution,
        &b
    ));
}

#[tokio::test]
async fn test_relative_path_references() {
    init_logging();
    let notes = Notes::new();
    let top = notes.write("top.typ", "[[sub/inner]] [[./sub/inner.typ]] [[inner]]");
    let inner = notes.write("sub/inner.typ", "[[../top]] [[/top.typ]] [[missing/top]]");
    let (coordinator, query) = notes.open(None).await;
    coordinator.scan(false).await.unwrap();

    let from_top = query.forward_links(&top).await.unwrap();
    assert!(from_top.iter().all(|l| resolves_to(&l.resolution, &inner)));
    let from_inner = query.forward_links(&inner).await.unwrap();
    assert!(resolves_to(&from_inner[0].resolution, &top));
    assert!(resolves_to(&from_inner[1].resolution, &top));
    assert_eq!(from_inner[2].resolution, Resolution::Unresolved);
}

#[tokio::test]
async fn test_concurrent_events_across_files() {
    init_logging();
    let notes = Notes::new();
    let (index_tx, mut index_rx) = tokio::sync::mpsc::unbounded_channel();
    let (coordinator, query) = notes.open(Some(index_tx)).await;
    let (file_tx, file_rx) = tokio::sync::mpsc::unbounded_channel();
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(file_rx).await })
    };

    let hub = notes.write("hub.typ", "#meta(title: \"Hub\")");
    file_tx.send(FileEvent::Created(hub.clone())).unwrap();
    for i in 0..20 {
        let path = notes.write(&format!("n{i}.typ"), "Back to [[Hub]].");
        file_tx.send(FileEvent::Created(path)).unwrap();
    }

    let mut indexed = 0;
    while indexed < 21 {
        let event = tokio::time::timeout(Duration::from_secs(10), index_rx.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, IndexEvent::FileIndexed { .. }) {
            indexed += 1;
        }
    }
    assert_eq!(query.backlinks(&hub).await.unwrap().len(), 20);
    drop(file_tx);
    runner.await.unwrap();
}
