//! Entries that must not be evicted while a caller still reads them.
//!
//! A render pins its template's hash for as long as the engine holds the
//! path. The evictor claims an entry before deleting it; a claim fails while
//! the entry is pinned, and a pin fails while the entry is being deleted.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Readers(usize),
    Evicting,
}

/// Shared registry of in-use cache entries, keyed by entry name.
#[derive(Debug, Default, Clone)]
pub struct EntryPins {
    entries: Arc<DashMap<String, Hold>>,
}

impl EntryPins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `name` out of eviction until the guard drops.
    ///
    /// Returns `None` while the entry is being evicted.
    pub fn pin(&self, name: &str) -> Option<EntryPin> {
        match self.entries.entry(name.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Hold::Readers(1));
            }
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                Hold::Readers(count) => *count += 1,
                Hold::Evicting => return None,
            },
        }
        Some(EntryPin {
            name: name.to_string(),
            entries: Arc::clone(&self.entries),
        })
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        matches!(self.entries.get(name).as_deref(), Some(Hold::Readers(_)))
    }

    /// Reserve `name` for deletion. Returns `None` while it is pinned.
    pub(crate) fn claim(&self, name: &str) -> Option<EvictionClaim> {
        match self.entries.entry(name.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Hold::Evicting);
                Some(EvictionClaim {
                    name: name.to_string(),
                    entries: Arc::clone(&self.entries),
                })
            }
            Entry::Occupied(_) => None,
        }
    }
}

/// Released when dropped.
#[derive(Debug)]
pub struct EntryPin {
    name: String,
    entries: Arc<DashMap<String, Hold>>,
}

impl Drop for EntryPin {
    fn drop(&mut self) {
        if let Entry::Occupied(mut occupied) = self.entries.entry(self.name.clone()) {
            match occupied.get_mut() {
                Hold::Readers(count) if *count > 1 => *count -= 1,
                Hold::Readers(_) => {
                    occupied.remove();
                }
                Hold::Evicting => {}
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct EvictionClaim {
    name: String,
    entries: Arc<DashMap<String, Hold>>,
}

impl Drop for EvictionClaim {
    fn drop(&mut self) {
        self.entries
            .remove_if(&self.name, |_, hold| *hold == Hold::Evicting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_are_counted_until_the_last_guard_drops() {
        let pins = EntryPins::new();
        let first = pins.pin("abc").expect("first pin");
        let second = pins.pin("abc").expect("second pin");
        assert!(pins.is_pinned("abc"));
        assert!(pins.claim("abc").is_none());

        drop(first);
        assert!(pins.is_pinned("abc"));
        drop(second);
        assert!(!pins.is_pinned("abc"));
        assert!(pins.claim("abc").is_some());
    }

    #[test]
    fn claimed_entry_cannot_be_pinned() {
        let pins = EntryPins::new();
        let claim = pins.claim("abc").expect("claim");
        assert!(pins.pin("abc").is_none());
        assert!(pins.claim("abc").is_none());

        drop(claim);
        let pin = pins.pin("abc").expect("pin after claim released");
        assert!(pins.is_pinned("abc"));
        drop(pin);
    }

    #[test]
    fn clones_share_one_registry() {
        let pins = EntryPins::new();
        let shared = pins.clone();
        let _pin = pins.pin("abc").expect("pin");
        assert!(shared.is_pinned("abc"));
        assert!(!shared.is_pinned("def"));
    }
}
