//! Bounded build output per build id

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Ring buffer of recent build output lines, keyed by build id
pub struct BuildLogStore {
    buffers: RwLock<HashMap<String, VecDeque<String>>>,
    capacity: usize,
}

impl BuildLogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a line, evicting the oldest once full
    pub fn push(&self, build_id: &str, line: impl Into<String>) {
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        let buffer = buffers
            .entry(build_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(64)));
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(line.into());
    }

    pub fn lines(&self, build_id: &str) -> Option<Vec<String>> {
        let buffers = self.buffers.read().unwrap_or_else(|e| e.into_inner());
        buffers
            .get(build_id)
            .map(|buffer| buffer.iter().cloned().collect())
    }

    /// Last `n` lines, oldest first
    pub fn tail(&self, build_id: &str, n: usize) -> Vec<String> {
        let buffers = self.buffers.read().unwrap_or_else(|e| e.into_inner());
        buffers
            .get(build_id)
            .map(|buffer| {
                let skip = buffer.len().saturating_sub(n);
                buffer.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn remove(&self, build_id: &str) -> bool {
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        buffers.remove(build_id).is_some()
    }

    /// Drop the buffers of several builds at once
    pub fn remove_all<'a>(&self, build_ids: impl IntoIterator<Item = &'a String>) -> usize {
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        build_ids
            .into_iter()
            .filter(|id| buffers.remove(id.as_str()).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        let buffers = self.buffers.read().unwrap_or_else(|e| e.into_inner());
        buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
