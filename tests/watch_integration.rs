//! WatchService integration tests: real filesystem notifications driving the index.

#[cfg(feature = "service")]
use std::{
    fs,
    time::{Duration, Instant},
};
#[cfg(feature = "service")]
use typst_oxide::{
    event::IndexEvent, query::GraphScope, resolver::Resolution, watch::WatchService,
};

mod common;

/// Poll `check` until it holds or `timeout` elapses.
#[cfg(feature = "service")]
fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    check()
}

#[test]
#[cfg(feature = "service")]
fn test_watch_service_follows_edits() {
    common::init_logging();
    let notes = common::Notes::new();
    fs::write(notes.path(".typst-oxide.toml"), "debounce_ms = 100\n").unwrap();
    let (a, b) = common::alpha_beta(&notes);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let service = WatchService::new(notes.root.clone(), Some(tx)).unwrap();
    assert_eq!(service.coordinator().config().debounce_ms, 100);
    service.start().unwrap();
    assert!(service.is_running());
    assert!(service.start().is_err());

    // Initial scan
    let mut scanned = false;
    assert!(wait_for(Duration::from_secs(10), || {
        while let Ok(event) = rx.try_recv() {
            scanned |= matches!(event, IndexEvent::ScanComplete { indexed: 2, .. });
        }
        scanned
    }));
    let query = service.query();
    assert_eq!(service.block_on(query.backlinks(&b)).unwrap().len(), 1);

    // A new note referencing Alpha
    let c = notes.write("c.typ", "Back to [[Alpha]].\n");
    assert!(wait_for(Duration::from_secs(10), || {
        service
            .block_on(query.backlinks(&a))
            .is_some_and(|links| links.len() == 1)
    }));
    assert_eq!(service.block_on(query.backlinks(&a)).unwrap()[0].source, c);

    // Retitling b breaks a's reference
    notes.write("b.typ", "#meta(title: \"Renamed\")\n");
    assert!(wait_for(Duration::from_secs(10), || {
        service
            .block_on(query.forward_links(&a))
            .is_some_and(|links| links[0].resolution == Resolution::Unresolved)
    }));

    // Deleting c removes it from the index
    notes.remove(&c);
    assert!(wait_for(Duration::from_secs(10), || {
        service.block_on(query.forward_links(&c)).is_none()
    }));
    assert!(service.block_on(query.backlinks(&a)).unwrap().is_empty());

    service.stop().unwrap();
    assert!(!service.is_running());
}

#[test]
#[cfg(feature = "service")]
fn test_watch_service_ignores_hidden_and_foreign_files() {
    common::init_logging();
    let notes = common::Notes::new();
    fs::write(notes.path(".typst-oxide.toml"), "debounce_ms = 100\n").unwrap();
    let (_a, b) = common::alpha_beta(&notes);

    let service = WatchService::new(notes.root.clone(), None).unwrap();
    service.start().unwrap();
    let query = service.query();
    assert!(wait_for(Duration::from_secs(10), || {
        service
            .block_on(query.backlinks(&b))
            .is_some_and(|links| links.len() == 1)
    }));

    notes.write(".drafts/secret.typ", "[[Beta]]");
    notes.write("scratch.md", "[[Beta]]");
    let visible = notes.write("visible.typ", "[[Beta]]");
    assert!(wait_for(Duration::from_secs(10), || {
        service
            .block_on(query.backlinks(&b))
            .is_some_and(|links| links.len() == 2)
    }));
    let sources: Vec<_> = service
        .block_on(query.backlinks(&b))
        .unwrap()
        .into_iter()
        .map(|link| link.source)
        .collect();
    assert!(sources.contains(&visible));
    assert_eq!(service.block_on(query.graph(&GraphScope::All)).unwrap().nodes.len(), 3);
}
