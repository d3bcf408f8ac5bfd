//! Module store.
//!
//! [`ModuleStore`] compiles plugin modules exactly once per distinct
//! [`ModuleSource`] and hands out cheap [`Module`] handles.  The cache is a
//! [`moka::sync::Cache`]; its `try_get_with` coalesces concurrent loads of
//! the same key so that only one caller compiles while the others wait, and
//! loads of unrelated sources never block each other.  Failed loads are not
//! cached.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use moka::sync::Cache;
use wasmtime::Engine;

use crate::config::SandboxConfig;
use crate::error::{HostError, Result};

/// Where module bytes come from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// A `.wasm` (or `.wat`) file on disk.
    Path(PathBuf),
    /// Bytes embedded in, or produced by, the host binary.
    Bytes { name: String, bytes: Arc<[u8]> },
}

impl ModuleSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Bytes {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    fn key(&self) -> Result<ModuleKey> {
        match self {
            Self::Path(path) => {
                let canonical = std::fs::canonicalize(path).map_err(|e| HostError::Load {
                    source_name: self.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(ModuleKey::Path(canonical))
            }
            Self::Bytes { name, bytes } => {
                let mut hasher = DefaultHasher::new();
                bytes.hash(&mut hasher);
                Ok(ModuleKey::Bytes {
                    name: name.clone(),
                    len: bytes.len(),
                    digest: hasher.finish(),
                })
            }
        }
    }
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Bytes { name, .. } => write!(f, "bytes:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ModuleKey {
    Path(PathBuf),
    Bytes {
        name: String,
        len: usize,
        digest: u64,
    },
}

/// An immutable compiled module.
///
/// Cloning is cheap; every clone refers to the same compiled artifact.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

struct ModuleInner {
    source: String,
    module: wasmtime::Module,
    engine: Engine,
    config: SandboxConfig,
}

impl Module {
    /// Display form of the source this module was loaded from.
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// The compiled wasmtime module.
    pub fn wasm(&self) -> &wasmtime::Module {
        &self.inner.module
    }

    /// The engine the module was compiled with.
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Limits applied to instances of this module.
    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Whether two handles refer to the same compiled artifact.
    pub fn same_artifact(a: &Module, b: &Module) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("source", &self.inner.source)
            .finish_non_exhaustive()
    }
}

/// Process-wide cache of compiled modules.
#[derive(Clone)]
pub struct ModuleStore {
    engine: Engine,
    config: SandboxConfig,
    cache: Cache<ModuleKey, Module>,
}

impl ModuleStore {
    /// Create a store whose engine meters fuel.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let mut wasm_config = wasmtime::Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.wasm_memory64(false);

        let engine = Engine::new(&wasm_config).map_err(|e| HostError::Load {
            source_name: "<engine>".into(),
            reason: format!("failed to create wasm engine: {e}"),
        })?;

        tracing::info!("module store initialized");

        Ok(Self {
            engine,
            config,
            cache: Cache::builder().name("modules").build(),
        })
    }

    /// Create a store with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(SandboxConfig::default())
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Load a module, compiling it only if this source has not been seen.
    pub fn load(&self, source: ModuleSource) -> Result<Module> {
        let key = source.key()?;
        let source_name = source.to_string();

        self.cache
            .try_get_with(key, || self.compile(&source))
            .map_err(|shared| HostError::Load {
                source_name,
                reason: shared.to_string(),
            })
    }

    /// Whether a module for `source` is already compiled and cached.
    pub fn contains(&self, source: &ModuleSource) -> bool {
        source
            .key()
            .map(|key| self.cache.contains_key(&key))
            .unwrap_or(false)
    }

    /// Drop a cached module.  Handles already given out stay valid.
    pub fn invalidate(&self, source: &ModuleSource) {
        if let Ok(key) = source.key() {
            self.cache.invalidate(&key);
            tracing::debug!(source = %source, "module invalidated");
        }
    }

    /// Number of cached modules.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn compile(&self, source: &ModuleSource) -> std::result::Result<Module, String> {
        let bytes: Arc<[u8]> = match source {
            ModuleSource::Path(path) => std::fs::read(path).map_err(|e| e.to_string())?.into(),
            ModuleSource::Bytes { bytes, .. } => Arc::clone(bytes),
        };

        let module = wasmtime::Module::new(&self.engine, &bytes).map_err(|e| e.to_string())?;

        tracing::info!(source = %source, size_bytes = bytes.len(), "compiled wasm module");

        Ok(Module {
            inner: Arc::new(ModuleInner {
                source: source.to_string(),
                module,
                engine: self.engine.clone(),
                config: self.config.clone(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal valid Wasm module (magic + version, no sections).
    fn minimal_wasm() -> Vec<u8> {
        vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00]
    }

    #[test]
    fn load_bytes_compiles_module() {
        let store = ModuleStore::with_defaults().unwrap();
        let module = store
            .load(ModuleSource::bytes("main", minimal_wasm()))
            .expect("minimal module must compile");
        assert_eq!(module.source(), "bytes:main");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn repeated_load_returns_cached_artifact() {
        let store = ModuleStore::with_defaults().unwrap();
        let a = store.load(ModuleSource::bytes("main", minimal_wasm())).unwrap();
        let b = store.load(ModuleSource::bytes("main", minimal_wasm())).unwrap();
        assert!(Module::same_artifact(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn different_bytes_under_same_name_are_distinct() {
        let store = ModuleStore::with_defaults().unwrap();
        let a = store.load(ModuleSource::bytes("main", minimal_wasm())).unwrap();
        let b = store
            .load(ModuleSource::bytes("main", b"(module (memory 1))".to_vec()))
            .unwrap();
        assert!(!Module::same_artifact(&a, &b));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn invalid_bytes_fail_with_load_error() {
        let store = ModuleStore::with_defaults().unwrap();
        let result = store.load(ModuleSource::bytes("bad", b"garbage bytes".to_vec()));
        match result {
            Err(HostError::Load { source_name, reason }) => {
                assert_eq!(source_name, "bytes:bad");
                assert!(!reason.is_empty());
            }
            other => panic!("expected Load error, got: {other:?}"),
        }
        assert!(store.is_empty());
    }

    #[test]
    fn failed_load_is_not_cached() {
        let store = ModuleStore::with_defaults().unwrap();
        let bad = ModuleSource::bytes("bad", b"garbage".to_vec());
        assert!(store.load(bad.clone()).is_err());
        assert!(!store.contains(&bad));
    }

    #[test]
    fn load_from_path_and_cache_by_canonical_path() {
        let tmp = tempfile::tempdir().expect("tempdir creation must succeed in tests");
        let path = tmp.path().join("plugin.wasm");
        std::fs::write(&path, minimal_wasm()).expect("write must succeed");

        let store = ModuleStore::with_defaults().unwrap();
        let a = store.load(ModuleSource::path(&path)).unwrap();
        let dotted = tmp.path().join(".").join("plugin.wasm");
        let b = store.load(ModuleSource::path(dotted)).unwrap();
        assert!(Module::same_artifact(&a, &b));
        assert!(store.contains(&ModuleSource::path(&path)));
    }

    #[test]
    fn missing_path_fails_with_load_error() {
        let tmp = tempfile::tempdir().expect("tempdir creation must succeed in tests");
        let store = ModuleStore::with_defaults().unwrap();
        let result = store.load(ModuleSource::path(tmp.path().join("missing.wasm")));
        assert!(matches!(result, Err(HostError::Load { .. })));
    }

    #[test]
    fn invalidate_forces_recompile() {
        let store = ModuleStore::with_defaults().unwrap();
        let source = ModuleSource::bytes("main", minimal_wasm());
        let a = store.load(source.clone()).unwrap();
        store.invalidate(&source);
        assert!(!store.contains(&source));
        let b = store.load(source).unwrap();
        assert!(!Module::same_artifact(&a, &b));
    }

    #[test]
    fn concurrent_loads_share_one_artifact() {
        let store = ModuleStore::with_defaults().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .load(ModuleSource::bytes("shared", minimal_wasm()))
                        .unwrap()
                })
            })
            .collect();
        let modules: Vec<Module> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for m in &modules[1..] {
            assert!(Module::same_artifact(&modules[0], m));
        }
    }
}
