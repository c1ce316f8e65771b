//! Persistent program state
//!
//! A [`StateDict`] maps vector keys to vector values and survives across
//! runs. Writes within a run are visible to later reads in the same run;
//! the host decides when (and whether) to persist the dictionary between
//! frames, using the changed flag to avoid redundant saves.

use indexmap::IndexMap;

use crate::model::vector::Vector;

#[derive(Debug, Default, Clone)]
pub struct StateDict {
    items: IndexMap<Vector, Vector>,
    changed: bool,
}

impl StateDict {
    pub fn new() -> StateDict {
        StateDict::default()
    }

    /// The stored value, or `null` when absent.
    pub fn get(&self, key: &Vector) -> Vector {
        self.items.get(key).cloned().unwrap_or_default()
    }

    pub fn contains(&self, key: &Vector) -> bool {
        self.items.contains_key(key)
    }

    /// Store a value; a `null` value removes the entry.
    pub fn set(&mut self, key: Vector, value: Vector) {
        if value.is_empty() {
            if self.items.shift_remove(&key).is_some() {
                self.changed = true;
            }
        } else {
            match self.items.get(&key) {
                Some(existing) if *existing == value => {}
                _ => {
                    self.items.insert(key, value);
                    self.changed = true;
                }
            }
        }
    }

    /// Has any entry been added, removed or altered since the last
    /// [`reset_changed`](StateDict::reset_changed)?
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn reset_changed(&mut self) {
        self.changed = false;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vector, &Vector)> {
        self.items.iter()
    }
}

impl FromIterator<(Vector, Vector)> for StateDict {
    fn from_iter<T: IntoIterator<Item = (Vector, Vector)>>(iter: T) -> StateDict {
        StateDict {
            items: iter.into_iter().collect(),
            changed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_null() {
        let state = StateDict::new();
        assert!(state.get(&Vector::symbol("missing")).is_empty());
    }

    #[test]
    fn test_round_trip() {
        let mut state = StateDict::new();
        let key = Vector::symbol("beat");
        state.set(key.clone(), Vector::from(7.0));
        assert_eq!(state.get(&key), Vector::from(7.0));
        assert!(state.changed());
    }

    #[test]
    fn test_same_value_does_not_mark_changed() {
        let mut state = StateDict::new();
        let key = Vector::symbol("beat");
        state.set(key.clone(), Vector::from(7.0));
        state.reset_changed();
        state.set(key, Vector::from(7.0));
        assert!(!state.changed());
    }

    #[test]
    fn test_null_removes_entry() {
        let mut state = StateDict::new();
        let key = Vector::symbol("beat");
        state.set(key.clone(), Vector::from(7.0));
        state.reset_changed();
        state.set(key.clone(), Vector::null());
        assert!(!state.contains(&key));
        assert!(state.changed());
    }

    #[test]
    fn test_compound_keys() {
        let mut state = StateDict::new();
        let key = Vector::compose(vec![Vector::symbol("pad"), Vector::from(3.0)]);
        state.set(key.clone(), Vector::from(1.0));
        let probe = Vector::compose(vec![Vector::symbol("pad"), Vector::from(3.0)]);
        assert_eq!(state.get(&probe), Vector::from(1.0));
    }
}
