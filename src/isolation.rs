//! Isolation root resolution and scoped ownership.
//!
//! This module provides:
//! - `resolve_root` — pure resolution of the isolation root directory from
//!   an explicit override, the environment, or the project-relative default
//! - `ScopeRegistry` / `IsolationScope` — exclusive, refcounted ownership of
//!   a root path for a declared lifetime, with deferred cleanup
//!
//! Resolution performs no I/O beyond existence and writability probes; the
//! root and its substructure are created lazily by the first write (the
//! state store and checkpoint manager create what they need). Cleanup
//! failures are retried with backoff and logged as warnings — they never
//! fail the owning run.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::PipelineError;

/// Single environment override selecting the base isolation root.
pub const ROOT_ENV_VAR: &str = "STAGECRAFT_ROOT";

/// Project-relative default when no override is present.
pub const DEFAULT_ROOT_DIR: &str = ".stagecraft";

const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_BACKOFF: Duration = Duration::from_millis(50);

/// How long a scope owns its root and when the tree is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLifetime {
    /// Per-test ownership; the tree is removed when the scope is released
    Function,
    /// Per-suite ownership; removed at release
    Class,
    /// Per-module ownership; removed at release
    Module,
    /// Long-lived production scope; the tree persists across releases
    #[default]
    Session,
}

impl ScopeLifetime {
    /// Whether releasing the last handle removes the tree.
    pub fn cleans_on_release(&self) -> bool {
        !matches!(self, Self::Session)
    }
}

impl std::str::FromStr for ScopeLifetime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "function" => Ok(Self::Function),
            "class" => Ok(Self::Class),
            "module" => Ok(Self::Module),
            "session" => Ok(Self::Session),
            _ => anyhow::bail!(
                "Invalid isolation lifetime '{}'. Valid values: function, class, module, session",
                s
            ),
        }
    }
}

/// Resolve the isolation root for a run.
///
/// Precedence: explicit override (used verbatim) → `STAGECRAFT_ROOT` →
/// `<cwd>/.stagecraft`. Relative inputs are resolved against the current
/// working directory; the result is always absolute. The directory is not
/// created here.
pub fn resolve_root(explicit: Option<&Path>) -> Result<PathBuf, PipelineError> {
    let candidate = if let Some(path) = explicit {
        path.to_path_buf()
    } else if let Some(env_root) = std::env::var_os(ROOT_ENV_VAR).filter(|v| !v.is_empty()) {
        PathBuf::from(env_root)
    } else {
        PathBuf::from(DEFAULT_ROOT_DIR)
    };

    let absolute = absolutize(&candidate)?;
    probe_writable(&absolute)?;
    Ok(absolute)
}

/// The documented fallback when the primary root is unwritable: a
/// user-scoped directory derived from the primary path, so distinct
/// projects never collide. The caller decides whether to use it and logs
/// the switch — never silently.
pub fn fallback_root(primary: &Path) -> PathBuf {
    let base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
    let mut hasher = Sha256::new();
    hasher.update(primary.as_os_str().as_encoded_bytes());
    let digest = hasher.finalize();
    let short = hex_prefix(&digest, 12);
    base.join("stagecraft").join(short)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
        if out.len() >= chars {
            out.truncate(chars);
            break;
        }
    }
    out
}

fn absolutize(path: &Path) -> Result<PathBuf, PipelineError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| PipelineError::PathResolution {
        path: path.to_path_buf(),
        reason: format!("cannot determine working directory: {}", e),
    })?;
    Ok(cwd.join(path))
}

/// Existence/metadata probe only — no writes, no creation.
fn probe_writable(path: &Path) -> Result<(), PipelineError> {
    let target = nearest_existing(path);
    let Some(target) = target else {
        return Ok(());
    };

    let metadata = std::fs::metadata(&target).map_err(|e| PipelineError::PathResolution {
        path: path.to_path_buf(),
        reason: format!("cannot stat {}: {}", target.display(), e),
    })?;

    if target == path && !metadata.is_dir() {
        return Err(PipelineError::PathResolution {
            path: path.to_path_buf(),
            reason: "exists but is not a directory".to_string(),
        });
    }
    if metadata.permissions().readonly() {
        return Err(PipelineError::PathResolution {
            path: path.to_path_buf(),
            reason: format!("{} is read-only", target.display()),
        });
    }
    Ok(())
}

/// Walk up to the closest ancestor that exists, to probe writability for a
/// root that has not been created yet.
fn nearest_existing(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(p) = current {
        if p.exists() {
            return Some(p.to_path_buf());
        }
        current = p.parent();
    }
    None
}

#[derive(Debug)]
struct ScopeState {
    lifetime: ScopeLifetime,
    refs: usize,
}

/// Tracks which root paths are owned by active scopes.
///
/// One registry is shared per process (the CLI creates one; tests create
/// their own). `acquire` on a path that is already owned fails with
/// `ScopeBusy` — two concurrently active scopes never share a root.
#[derive(Debug, Clone, Default)]
pub struct ScopeRegistry {
    inner: Arc<Mutex<HashMap<PathBuf, ScopeState>>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive ownership of `root` for the given lifetime.
    pub fn acquire(
        &self,
        root: &Path,
        lifetime: ScopeLifetime,
    ) -> Result<IsolationScope, PipelineError> {
        let mut scopes = self.inner.lock().expect("scope registry lock poisoned");
        if scopes.contains_key(root) {
            return Err(PipelineError::ScopeBusy {
                path: root.to_path_buf(),
            });
        }
        scopes.insert(root.to_path_buf(), ScopeState { lifetime, refs: 1 });
        Ok(IsolationScope {
            registry: self.clone(),
            root: root.to_path_buf(),
            lifetime,
        })
    }

    /// Whether any active scope owns `root`.
    pub fn is_active(&self, root: &Path) -> bool {
        self.inner
            .lock()
            .expect("scope registry lock poisoned")
            .contains_key(root)
    }

    fn retain(&self, root: &Path) {
        let mut scopes = self.inner.lock().expect("scope registry lock poisoned");
        if let Some(state) = scopes.get_mut(root) {
            state.refs += 1;
        }
    }

    /// Drop one reference; the last release reclaims the tree for lifetimes
    /// that clean up.
    fn release(&self, root: &Path) {
        let cleanup = {
            let mut scopes = self.inner.lock().expect("scope registry lock poisoned");
            let Some(state) = scopes.get_mut(root) else {
                return;
            };
            state.refs -= 1;
            if state.refs > 0 {
                return;
            }
            let lifetime = state.lifetime;
            scopes.remove(root);
            lifetime.cleans_on_release()
        };

        if cleanup {
            cleanup_with_retry(root);
        }
    }
}

/// Removes the scope's tree, retrying transient failures with backoff.
/// Final failure is logged and swallowed — cleanup never fails a run.
fn cleanup_with_retry(root: &Path) {
    if !root.exists() {
        return;
    }
    for attempt in 1..=CLEANUP_ATTEMPTS {
        match std::fs::remove_dir_all(root) {
            Ok(()) => return,
            Err(e) if attempt < CLEANUP_ATTEMPTS => {
                tracing::debug!(
                    path = %root.display(),
                    attempt,
                    error = %e,
                    "scope cleanup failed, retrying"
                );
                std::thread::sleep(CLEANUP_BACKOFF * attempt);
            }
            Err(e) => {
                tracing::warn!(
                    path = %root.display(),
                    error = %e,
                    "scope cleanup failed after {} attempts; leaving tree behind",
                    CLEANUP_ATTEMPTS
                );
            }
        }
    }
}

/// Handle to an exclusively-owned isolation root.
///
/// Cloning adds a consumer; the tree is reclaimed (per lifetime policy)
/// only when the last handle drops.
#[derive(Debug)]
pub struct IsolationScope {
    registry: ScopeRegistry,
    root: PathBuf,
    lifetime: ScopeLifetime,
}

impl IsolationScope {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lifetime(&self) -> ScopeLifetime {
        self.lifetime
    }
}

impl Clone for IsolationScope {
    fn clone(&self) -> Self {
        self.registry.retain(&self.root);
        Self {
            registry: self.registry.clone(),
            root: self.root.clone(),
            lifetime: self.lifetime,
        }
    }
}

impl Drop for IsolationScope {
    fn drop(&mut self) {
        self.registry.release(&self.root);
    }
}
