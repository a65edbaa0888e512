//! Process-wide name → [`Buffer`] registry.
//!
//! Grounded on `original_source/code/mmapBuffer.cpp`'s static `bufferMap` plus DESIGN NOTES §9
//! ("model it as a lock-guarded mapping initialized once at process start"). `vector_buffers`
//! itself doesn't need a named-instance registry (each buffer is owned directly by its topology
//! component), so this module's shape is original to this crate rather than lifted from a
//! specific teacher file; it follows the same `OnceLock<Mutex<_>>` lazy-singleton idiom the
//! teacher uses elsewhere (e.g. `Buffer`'s own two-phase `OnceLock` init).

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;

use crate::buffer::Buffer;

fn registry() -> &'static Mutex<HashMap<String, Arc<Buffer>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Buffer>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the named buffer, creating an uninitialized one if it doesn't exist yet.
///
/// The returned handle still needs [`Buffer::init`](crate::buffer::Buffer::init) called on it
/// before `try_append`/`flush`/etc. will work; lookup and configuration are deliberately
/// separate steps, matching `initBuffer`'s idempotent, call-it-from-anywhere contract in
/// spec.md §4.2.
pub fn get_buffer_instance(name: impl AsRef<str>) -> Arc<Buffer> {
    let name = name.as_ref();
    let mut map = registry().lock();
    if let Some(buffer) = map.get(name) {
        return Arc::clone(buffer);
    }
    let buffer = Buffer::new_uninit(name);
    map.insert(name.to_string(), Arc::clone(&buffer));
    buffer
}

/// Flushes and removes the named buffer from the registry, if present.
///
/// Dropping the last `Arc` (which this usually is, since the registry itself held the only
/// other reference) runs `Buffer`'s `Drop` impl: a final flush, then a join of the persister
/// thread.
pub fn remove_buffer_instance(name: impl AsRef<str>) -> bool {
    registry().lock().remove(name.as_ref()).is_some()
}
