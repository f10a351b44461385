//! Spreads requests across the endpoints serving a model
//!
//! The resolver always returns candidates in registry order. With round-robin balancing each
//! request for a model starts one position further along that list and wraps around, so the
//! first attempt rotates across endpoints while the remaining candidates stay available as
//! fallbacks.

use crate::settings::Balance;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct LoadBalancer {
    balance: Balance,
    /// Per-model request counters
    cursors: DashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(balance: Balance) -> Self {
        Self {
            balance,
            cursors: DashMap::new(),
        }
    }

    /// Reorder `candidates` for the next request to `model`.
    pub fn order<T>(&self, model: &str, mut candidates: Vec<T>) -> Vec<T> {
        if self.balance == Balance::InOrder || candidates.len() < 2 {
            return candidates;
        }

        let turn = match self.cursors.get(model) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed),
            None => self
                .cursors
                .entry(model.to_string())
                .or_default()
                .fetch_add(1, Ordering::Relaxed),
        };
        let len = candidates.len();
        candidates.rotate_left(turn % len);
        candidates
    }
}
