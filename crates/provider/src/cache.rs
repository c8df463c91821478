use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::types::{ChatRequest, ChatResponse};

/// Deterministic response cache. Keys are pure functions of the request:
/// `(model, sha256(stable prefix), sha256(variable suffix), temperature)`.
/// Temperature is quantized to millis so f32 noise cannot split entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    model: String,
    prefix_hash: [u8; 32],
    suffix_hash: [u8; 32],
    temperature_millis: i32,
}

impl CacheKey {
    pub fn for_request(request: &ChatRequest) -> Self {
        Self {
            model: request.model.clone(),
            prefix_hash: Sha256::digest(request.system.as_bytes()).into(),
            suffix_hash: Sha256::digest(request.user.as_bytes()).into(),
            temperature_millis: (request.temperature.unwrap_or(0.0) * 1000.0).round() as i32,
        }
    }
}

pub struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, ChatResponse>>,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, request: &ChatRequest) -> Option<ChatResponse> {
        let key = CacheKey::for_request(request);
        self.entries.lock().ok()?.get(&key).cloned()
    }

    pub fn put(&self, request: &ChatRequest, response: &ChatResponse) {
        let key = CacheKey::for_request(request);
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= self.capacity && !entries.contains_key(&key) {
                // Full and new: drop an arbitrary entry to stay bounded.
                if let Some(victim) = entries.keys().next().cloned() {
                    entries.remove(&victim);
                }
            }
            entries.insert(key, response.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
