//! Hash collections keyed with foldhash, plus the small-vector type used across the engine.

pub use smallvec::{smallvec, SmallVec};

pub mod hashmap {
    pub use hashbrown::hash_map::Entry;

    pub type HashMap<K, V> = hashbrown::HashMap<K, V, foldhash::fast::RandomState>;
}

pub mod hashset {
    pub type HashSet<K> = hashbrown::HashSet<K, foldhash::fast::RandomState>;
}
