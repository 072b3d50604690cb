use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use http::RequestProxy;
use notify::{EventKind, RecursiveMode, Watcher};

const SETTLE: Duration = Duration::from_millis(50);

/// Invalidates every isolate when a file under `root` changes. Events that
/// arrive together collapse into one invalidation. Watching stops when the
/// returned watcher is dropped.
pub fn start_watch(
    root: &Path,
    proxy: Arc<RequestProxy>,
) -> notify::Result<notify::RecommendedWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Ok(event) if is_change(&event.kind) => {
                    tokio::time::sleep(SETTLE).await;
                    while rx.try_recv().is_ok() {}
                    let changed: Vec<String> = event
                        .paths
                        .iter()
                        .map(|path| path.to_string_lossy().to_string())
                        .collect();
                    tracing::info!("Changed {}; invalidating isolates", changed.join(", "));
                    proxy.invalidate();
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("watch error: {}", err),
            }
        }
    });

    Ok(watcher)
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};

    #[test]
    fn only_content_changes_invalidate() {
        assert!(is_change(&EventKind::Create(CreateKind::File)));
        assert!(is_change(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_change(&EventKind::Access(AccessKind::Any)));
    }
}
