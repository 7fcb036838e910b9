use std::env;
use std::error::Error;

use stream_download_cache::{CacheEvent, CacheSettings, FetchState, MediaCache};
use tracing::info;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

const HEAD_BYTES: u64 = 64 * 1024;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::default()
                .add_directive("stream_download_cache=debug".parse()?)
                .add_directive(LevelFilter::INFO.into()),
        )
        .with_line_number(false)
        .with_file(false)
        .init();

    let url = env::args()
        .nth(1)
        .unwrap_or_else(|| "https://www.soundhelix.com/examples/mp3/SoundHelix-Song-1.mp3".into())
        .parse()?;

    let settings = CacheSettings::default()
        .with_cache_dir(env::temp_dir().join("stream-download-cache-demo"))
        .with_verify_downloaded_file_size(true);
    let cache = MediaCache::open(settings)?;

    let mut events = cache.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CacheEvent::ContentInfo { info, .. } => {
                    info!(mime = ?info.mime_type, length = ?info.total_length, "content info");
                }
                CacheEvent::Progress { committed, expected, .. } => {
                    info!(committed, ?expected, "progress");
                }
                CacheEvent::Completed { path, .. } => info!(path = %path.display(), "completed"),
                CacheEvent::Failed { error, .. } => info!(%error, "failed"),
                CacheEvent::StateChanged { .. } => {}
            }
        }
    });

    // Like a player probing the container header before anything else.
    let session = cache.session(&url)?;
    let head = session.request_range(0, HEAD_BYTES)?.collect_bytes().await?;
    info!(bytes = head.len(), "header range ready");

    // Then seeking into the middle once the length is known.
    if let Some(total) = session.content_info().and_then(|i| i.total_length) {
        let middle = total / 2;
        let chunk = session.request_range(middle, HEAD_BYTES)?.collect_bytes().await?;
        info!(offset = middle, bytes = chunk.len(), "middle range ready");
    }

    match session.finished().await {
        FetchState::Completed => {
            let entry = session.entry();
            info!(
                key = %entry.resource_key,
                path = %entry.file_path.display(),
                bytes = entry.committed_bytes,
                "cached"
            );
        }
        other => info!(state = ?other, "download did not complete"),
    }

    cache.shutdown();
    Ok(())
}
