use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::hot_reload::producer::Artifact;

/// Content hash of a descriptor file.
pub(crate) type ContentHash = [u8; 32];

pub(crate) fn hash_content(bytes: &[u8]) -> ContentHash {
    *blake3::hash(bytes).as_bytes()
}

/// Bounded LRU of recently produced artifacts, keyed by descriptor content
/// hash. Short-circuits repeated production of identical content across a
/// file-save storm.
pub(crate) struct ArtifactCache {
    capacity: usize,
    entries: FxHashMap<ContentHash, Artifact>,
    order: VecDeque<ContentHash>,
}

impl ArtifactCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: FxHashMap::default(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, hash: &ContentHash) -> Option<Artifact> {
        let artifact = self.entries.get(hash).cloned()?;
        self.touch(hash);
        Some(artifact)
    }

    pub fn put(&mut self, hash: ContentHash, artifact: Artifact) {
        if self.entries.insert(hash, artifact).is_some() {
            self.touch(&hash);
            return;
        }
        self.order.push_back(hash);
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn touch(&mut self, hash: &ContentHash) {
        if let Some(position) = self.order.iter().position(|h| h == hash) {
            self.order.remove(position);
            self.order.push_back(*hash);
        }
    }
}
