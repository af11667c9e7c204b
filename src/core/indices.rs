use std::hash::Hash;

use hashbrown::HashMap;

use crate::types::EntityRef;

/// Multi-valued index from a key to the records pointing at it.
pub type VecIndex<K, V = EntityRef> = HashMap<K, Vec<V>>;

/// Adds `value` under `key` unless already present. Keeps insertion order.
pub fn link<K: Eq + Hash, V: PartialEq>(index: &mut VecIndex<K, V>, key: K, value: V) {
    let values = index.entry(key).or_default();
    if !values.contains(&value) {
        values.push(value);
    }
}

/// Removes `value` from `key`, dropping the key once empty.
pub fn unlink<K: Eq + Hash, V: PartialEq>(index: &mut VecIndex<K, V>, key: &K, value: &V) {
    if let Some(values) = index.get_mut(key) {
        if let Some(pos) = values.iter().position(|v| v == value) {
            values.remove(pos);
        }
        if values.is_empty() {
            index.remove(key);
        }
    }
}
