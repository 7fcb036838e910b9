//! End-to-end cache tests over HTTP.
//!
//! Every test runs a local [`CacheFixture`] server (no external network) and a `MediaCache`
//! rooted in its own temp directory, covering:
//! - progressive range delivery while the body is still trickling in,
//! - failure handling (404, size floor) and that failures leave no file behind,
//! - warm-cache reuse across cache instances,
//! - one network request per resource under concurrent range requests,
//! - request header forwarding and event ordering.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rstest::rstest;
use tokio::sync::broadcast;
use url::Url;

use stream_download_cache::{
    CacheError, CacheEvent, CacheSession, CacheSettings, FetchState, MediaCache,
};
use stream_download_cache_tests::{CacheFixture, SERVER_RT};

const WAIT: Duration = Duration::from_secs(10);

fn settings(root: &Path) -> CacheSettings {
    CacheSettings::default()
        .with_cache_dir(root.join("cache"))
        .with_janitor_marker(root.join("cache.last-clear"))
}

async fn finished(session: &CacheSession) -> FetchState {
    tokio::time::timeout(WAIT, session.finished())
        .await
        .expect("session did not finish in time")
}

/// Collect events up to and including the first `Completed` or `Failed`.
async fn events_until_terminal(rx: &mut broadcast::Receiver<CacheEvent>) -> Vec<CacheEvent> {
    let mut out = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no terminal event in time")
            .expect("event channel closed");
        let done = matches!(
            event,
            CacheEvent::Completed { .. } | CacheEvent::Failed { .. }
        );
        out.push(event);
        if done {
            // Anything emitted later for the same key would be a second terminal event.
            while let Ok(extra) = rx.try_recv() {
                out.push(extra);
            }
            return out;
        }
    }
}

fn cache_dir_entries(settings: &CacheSettings) -> usize {
    std::fs::read_dir(&settings.cache_dir)
        .map(|d| d.count())
        .unwrap_or(0)
}

#[rstest]
#[case(64 * 1024, Duration::ZERO)]
#[case(4 * 1024, Duration::from_millis(2))]
fn http_ranges_are_served_progressively(#[case] chunk: usize, #[case] delay: Duration) {
    SERVER_RT.block_on(async {
        let fixture = CacheFixture::new().with_chunking(chunk, delay);
        let base = fixture.start().await;
        let url = base.join("track.mp3").unwrap();
        let expected = fixture.blob("track.mp3");

        let root = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(
            settings(root.path())
                .with_download_buffer_limit(8 * 1024)
                .with_read_data_limit(10 * 1024)
                .with_verify_downloaded_file_size(true),
        )
        .unwrap();

        let session = cache.session(&url).unwrap();
        let tail = session.request_range(200_000, 50_000).unwrap();
        let head = session.request_range(0, 1024).unwrap();

        let head = tokio::time::timeout(WAIT, head.collect_bytes())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head, expected.slice(0..1024));

        let mut tail = tail;
        let mut got = Vec::new();
        while let Some(chunk) = tokio::time::timeout(WAIT, tail.next()).await.unwrap() {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= 10 * 1024, "read_data_limit exceeded");
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, expected.slice(200_000..250_000));

        assert_eq!(finished(&session).await, FetchState::Completed);
        let info = session.content_info().unwrap();
        assert_eq!(info.mime_type.as_deref(), Some("audio/mpeg"));
        assert_eq!(info.total_length, Some(expected.len() as u64));

        let path = cache.cached_path(&url).expect("complete file must exist");
        assert_eq!(std::fs::read(path).unwrap(), expected);
        assert_eq!(fixture.request_count_for("/track.mp3").unwrap(), 1);
    });
}

#[test]
fn missing_resource_fails_pending_requests_and_leaves_no_file() {
    SERVER_RT.block_on(async {
        let fixture = CacheFixture::new();
        let base = fixture.start().await;
        let url = base.join("missing.mp3").unwrap();

        let root = tempfile::tempdir().unwrap();
        let s = settings(root.path());
        let cache = MediaCache::open(s.clone()).unwrap();

        let session = cache.session(&url).unwrap();
        let stream = session.request_range(0, 10).unwrap();

        let err = tokio::time::timeout(WAIT, stream.collect_bytes())
            .await
            .unwrap()
            .unwrap_err();
        assert!(
            matches!(err, CacheError::HttpStatus { status: 404, .. }),
            "{err}"
        );
        assert_eq!(finished(&session).await, FetchState::Failed);
        assert!(cache.cached_path(&url).is_none());
        assert_eq!(cache_dir_entries(&s), 0);
    });
}

#[test]
fn download_below_minimum_size_is_rejected() {
    SERVER_RT.block_on(async {
        let fixture = CacheFixture::new();
        let base = fixture.start().await;
        let url = base.join("short.mp3").unwrap();

        let root = tempfile::tempdir().unwrap();
        let s = settings(root.path()).with_minimum_expected_file_size(1000);
        let cache = MediaCache::open(s.clone()).unwrap();
        let mut events = cache.subscribe();

        let session = cache.session(&url).unwrap();
        session.start().unwrap();
        assert_eq!(finished(&session).await, FetchState::Failed);
        assert_eq!(cache_dir_entries(&s), 0);

        let mut failures = Vec::new();
        for event in events_until_terminal(&mut events).await {
            match event {
                CacheEvent::Failed { error, .. } => failures.push(error),
                CacheEvent::Completed { .. } => panic!("rejected download reported completion"),
                _ => {}
            }
        }
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("minimum"), "{}", failures[0]);
    });
}

#[test]
fn warm_cache_is_not_fetched_again() {
    SERVER_RT.block_on(async {
        let fixture = CacheFixture::new();
        let base = fixture.start().await;
        let url = base.join("track.mp3").unwrap();
        let expected = fixture.blob("track.mp3");
        let root = tempfile::tempdir().unwrap();

        for run in 0..2 {
            let cache = MediaCache::open(settings(root.path())).unwrap();
            let bytes = cache
                .request_range_for_url(&url, 1000, 5000)
                .unwrap()
                .collect_bytes()
                .await
                .unwrap();
            assert_eq!(bytes, expected.slice(1000..6000), "run {run}");

            let session = cache.session(&url).unwrap();
            assert_eq!(finished(&session).await, FetchState::Completed);
        }

        assert_eq!(fixture.request_count_for("/track.mp3").unwrap(), 1);
    });
}

#[test]
fn concurrent_range_requests_share_one_request() {
    SERVER_RT.block_on(async {
        let fixture = CacheFixture::new().with_chunking(8 * 1024, Duration::from_millis(1));
        let base = fixture.start().await;
        let url = base.join("track.mp3").unwrap();
        let expected = fixture.blob("track.mp3");

        let root = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::open(settings(root.path())).unwrap());

        let mut tasks = Vec::new();
        for i in 0..8u64 {
            let cache = cache.clone();
            let url: Url = url.clone();
            tasks.push(tokio::spawn(async move {
                let offset = i * 30_000;
                let bytes = cache
                    .request_range_for_url(&url, offset, 10_000)
                    .unwrap()
                    .collect_bytes()
                    .await
                    .unwrap();
                (offset, bytes)
            }));
        }

        for task in tasks {
            let (offset, bytes) = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
            let start = offset as usize;
            assert_eq!(bytes, expected.slice(start..start + 10_000));
        }
        assert_eq!(fixture.request_count_for("/track.mp3").unwrap(), 1);
    });
}

#[test]
fn configured_headers_are_sent() {
    SERVER_RT.block_on(async {
        let fixture = CacheFixture::new();
        let base = fixture.start().await;
        let url = base.join("short.mp3").unwrap();

        let root = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(
            settings(root.path()).with_request_header("Authorization", "Bearer token-123"),
        )
        .unwrap();

        let session = cache.session(&url).unwrap();
        session.start().unwrap();
        assert_eq!(finished(&session).await, FetchState::Completed);
        assert_eq!(
            fixture.last_header("/short.mp3", "authorization").as_deref(),
            Some("Bearer token-123")
        );
    });
}

#[test]
fn events_report_progress_then_one_completion() {
    SERVER_RT.block_on(async {
        let fixture = CacheFixture::new().with_chunking(16 * 1024, Duration::ZERO);
        let base = fixture.start().await;
        let url = base.join("track.mp3").unwrap();
        let total = fixture.blob("track.mp3").len() as u64;

        let root = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(
            settings(root.path()).with_download_buffer_limit(32 * 1024),
        )
        .unwrap();
        let mut events = cache.subscribe();

        let session = cache.session(&url).unwrap();
        session.start().unwrap();
        assert_eq!(finished(&session).await, FetchState::Completed);

        let mut last_committed = 0;
        let mut completed = 0;
        let mut states = Vec::new();
        for event in events_until_terminal(&mut events).await {
            assert_eq!(event.key(), session.key());
            match event {
                CacheEvent::Progress { committed, expected, .. } => {
                    assert!(committed >= last_committed, "progress went backwards");
                    assert_eq!(expected, Some(total));
                    last_committed = committed;
                }
                CacheEvent::Completed { path, .. } => {
                    completed += 1;
                    assert!(path.is_file());
                }
                CacheEvent::StateChanged { state, .. } => states.push(state),
                CacheEvent::Failed { error, .. } => panic!("unexpected failure: {error}"),
                CacheEvent::ContentInfo { .. } => {}
            }
        }
        assert_eq!(last_committed, total);
        assert_eq!(completed, 1);
        assert_eq!(states, vec![FetchState::Fetching, FetchState::Completed]);

        let entry = session.entry();
        assert!(entry.is_complete);
        assert_eq!(entry.committed_bytes, total);
        assert_eq!(entry.expected_length, Some(total));
    });
}
