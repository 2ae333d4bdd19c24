//! System prompt loading with mtime-keyed caching.

use std::path::PathBuf;
use std::time::SystemTime;

use parking_lot::Mutex;

/// Cached system prompt, re-read only when the file's mtime changes.
///
/// Reads are serialised by the mutex; after a read the mtime is checked
/// again so a write landing between the stat and the read invalidates the
/// freshly cached value instead of sticking.
pub struct SystemPromptCache {
    path: PathBuf,
    fallback: String,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    prompt: Option<String>,
    mtime: Option<SystemTime>,
}

impl SystemPromptCache {
    /// Create a cache for the prompt at `path`, with `fallback` used when
    /// the file is absent or unreadable.
    pub fn new(path: PathBuf, fallback: impl Into<String>) -> Self {
        Self {
            path,
            fallback: fallback.into(),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Load the system prompt.
    pub fn get(&self) -> String {
        let mut state = self.state.lock();

        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return self.fallback.clone(),
        };

        if let Some(ref cached) = state.prompt {
            if state.mtime == Some(mtime) {
                return cached.clone();
            }
        }

        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e,
                    "Failed to read system prompt, using default");
                return self.fallback.clone();
            }
        };

        // Re-verify: if the file changed between the stat and the read, the
        // next call must not trust this cache entry.
        let verified_mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        state.prompt = Some(text.clone());
        state.mtime = if verified_mtime == Some(mtime) {
            Some(mtime)
        } else {
            None
        };

        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_fallback() {
        let cache = SystemPromptCache::new(
            PathBuf::from("/nonexistent/prompt.md"),
            "default prompt",
        );
        assert_eq!(cache.get(), "default prompt");
    }

    #[test]
    fn reads_and_caches_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.md");
        std::fs::write(&path, "You are Ivan.").unwrap();

        let cache = SystemPromptCache::new(path.clone(), "default");
        assert_eq!(cache.get(), "You are Ivan.");
        assert_eq!(cache.get(), "You are Ivan.");
    }

    #[test]
    fn mtime_change_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.md");
        std::fs::write(&path, "first").unwrap();

        let cache = SystemPromptCache::new(path.clone(), "default");
        assert_eq!(cache.get(), "first");

        // Force a distinct mtime; filesystem clocks can be coarse.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.write_all(b"second").unwrap();
        drop(file);
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let file = std::fs::File::open(&path).unwrap();
        file.set_modified(later).unwrap();

        assert_eq!(cache.get(), "second");
    }
}
