//! Handle-based control surface
//!
//! Engines live in a process-wide registry and are addressed by opaque
//! handles. No function here panics or returns an error type: failures,
//! unknown handles and caught panics all map to a sentinel (`false`, `0`,
//! an empty vector) and are reported through the engine's error callback
//! when an engine is available.

use crate::callbacks::EngineCallbacks;
use crate::config::EngineConfig;
use crate::engine::FilteringEngine;
use crate::filtering::{Category, EngineOption};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Opaque engine handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(u64);

impl EngineHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

lazy_static! {
    /// Live engines by raw handle
    static ref ENGINES: Mutex<HashMap<u64, Arc<FilteringEngine>>> = Mutex::new(HashMap::new());
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn lookup(handle: EngineHandle) -> Option<Arc<FilteringEngine>> {
    ENGINES.lock().get(&handle.0).cloned()
}

/// Run `op` against the engine behind `handle`, mapping every failure to `fallback`
fn with_engine<T>(
    handle: EngineHandle,
    operation: &'static str,
    fallback: T,
    op: impl FnOnce(&FilteringEngine) -> T,
) -> T {
    let Some(engine) = lookup(handle) else {
        error!(handle = handle.0, operation, "Unknown engine handle");
        return fallback;
    };

    match catch_unwind(AssertUnwindSafe(|| op(&engine))) {
        Ok(value) => value,
        Err(_) => {
            engine
                .reporter()
                .error(&format!("Engine operation {} panicked", operation));
            fallback
        }
    }
}

/// Construct an engine; `None` when construction fails
pub fn create(config: EngineConfig, callbacks: EngineCallbacks) -> Option<EngineHandle> {
    let on_error = callbacks.on_error.clone();
    let result = catch_unwind(AssertUnwindSafe(|| FilteringEngine::new(config, callbacks)));

    let message = match result {
        Ok(Ok(engine)) => {
            let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
            ENGINES.lock().insert(handle, Arc::new(engine));
            return Some(EngineHandle(handle));
        }
        Ok(Err(e)) => format!("Failed to create engine: {}", e),
        Err(_) => "Engine construction panicked".to_string(),
    };

    error!("{}", message);
    if let Some(cb) = on_error {
        cb(&message);
    }
    None
}

/// Stop and release an engine; false for an unknown handle
pub fn destroy(handle: EngineHandle) -> bool {
    let Some(engine) = ENGINES.lock().remove(&handle.0) else {
        return false;
    };
    catch_unwind(AssertUnwindSafe(move || drop(engine))).is_ok()
}

pub fn start(handle: EngineHandle) -> bool {
    with_engine(handle, "start", false, |engine| match engine.start() {
        Ok(()) => true,
        Err(e) => {
            engine
                .reporter()
                .error(&format!("Failed to start engine: {}", e));
            false
        }
    })
}

pub fn stop(handle: EngineHandle) -> bool {
    with_engine(handle, "stop", false, |engine| {
        engine.stop();
        true
    })
}

pub fn is_running(handle: EngineHandle) -> bool {
    with_engine(handle, "is_running", false, FilteringEngine::is_running)
}

pub fn get_http_listener_port(handle: EngineHandle) -> u16 {
    with_engine(handle, "get_http_listener_port", 0, FilteringEngine::http_listener_port)
}

pub fn get_https_listener_port(handle: EngineHandle) -> u16 {
    with_engine(handle, "get_https_listener_port", 0, FilteringEngine::https_listener_port)
}

pub fn get_option(handle: EngineHandle, option: u32) -> bool {
    let Some(option) = EngineOption::from_id(option) else {
        return false;
    };
    with_engine(handle, "get_option", false, |engine| engine.option_enabled(option))
}

/// False for an unknown handle or option id
pub fn set_option(handle: EngineHandle, option: u32, enabled: bool) -> bool {
    let Some(option) = EngineOption::from_id(option) else {
        return false;
    };
    with_engine(handle, "set_option", false, |engine| {
        engine.set_option_enabled(option, enabled);
        true
    })
}

pub fn get_category(handle: EngineHandle, category: u8) -> bool {
    with_engine(handle, "get_category", false, |engine| {
        engine.category_enabled(Category(category))
    })
}

pub fn set_category(handle: EngineHandle, category: u8, enabled: bool) -> bool {
    with_engine(handle, "set_category", false, |engine| {
        engine.set_category_enabled(Category(category), enabled);
        true
    })
}

/// `(loaded, failed)`; `(0, 0)` when the file cannot be read
pub fn load_list_from_file(
    handle: EngineHandle,
    path: impl AsRef<Path>,
    category: u8,
    flush: bool,
) -> (usize, usize) {
    let path = path.as_ref();
    with_engine(handle, "load_list_from_file", (0, 0), |engine| {
        match engine.load_filtering_list_from_file(path, Category(category), flush) {
            Ok(counts) => (counts.loaded, counts.failed),
            Err(e) => {
                engine.reporter().error(&format!(
                    "Failed to load filter list {}: {}",
                    path.display(),
                    e
                ));
                (0, 0)
            }
        }
    })
}

pub fn load_list_from_string(
    handle: EngineHandle,
    text: &str,
    category: u8,
    flush: bool,
) -> (usize, usize) {
    with_engine(handle, "load_list_from_string", (0, 0), |engine| {
        let counts = engine.load_filtering_list_from_string(text, Category(category), flush);
        (counts.loaded, counts.failed)
    })
}

pub fn load_text_triggers_from_file(
    handle: EngineHandle,
    path: impl AsRef<Path>,
    category: u8,
    flush: bool,
) -> usize {
    let path = path.as_ref();
    with_engine(handle, "load_text_triggers_from_file", 0, |engine| {
        match engine.load_text_triggers_from_file(path, Category(category), flush) {
            Ok(counts) => counts.loaded,
            Err(e) => {
                engine.reporter().error(&format!(
                    "Failed to load text triggers {}: {}",
                    path.display(),
                    e
                ));
                0
            }
        }
    })
}

pub fn load_text_triggers_from_string(
    handle: EngineHandle,
    text: &str,
    category: u8,
    flush: bool,
) -> usize {
    with_engine(handle, "load_text_triggers_from_string", 0, |engine| {
        engine
            .load_text_triggers_from_string(text, Category(category), flush)
            .loaded
    })
}

/// Root certificate PEM bytes; empty for an unknown handle
pub fn get_root_ca_pem(handle: EngineHandle) -> Vec<u8> {
    with_engine(handle, "get_root_ca_pem", Vec::new(), |engine| {
        engine.root_certificate_pem().as_bytes().to_vec()
    })
}

pub fn unload_rules_for_category(handle: EngineHandle, category: u8) -> bool {
    with_engine(handle, "unload_rules_for_category", false, |engine| {
        engine.unload_rules_for_category(Category(category));
        true
    })
}
