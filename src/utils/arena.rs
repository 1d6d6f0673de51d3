/// Bounded slab arena with generation-tagged keys
///
/// Slots are added in fixed-size chunks up to a hard capacity; once the
/// arena is full, `insert` fails instead of growing. Free slots at the tail
/// beyond `max_free_chunks` chunks are released. A key stays invalid forever
/// once its entry is removed, even if the slot is reused or released.
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Raw slot address: index plus generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Typed wrapper around a [`Key`]
pub trait ArenaKey: Copy {
    fn from_key(key: Key) -> Self;
    fn key(self) -> Key;
}

/// Declare a copyable id type backed by an arena key
#[macro_export]
macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name($crate::utils::arena::Key);

        impl $crate::utils::arena::ArenaKey for $name {
            fn from_key(key: $crate::utils::arena::Key) -> Self {
                $name(key)
            }

            fn key(self) -> $crate::utils::arena::Key {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", self.0.index(), self.0.generation_tag())
            }
        }
    };
}

impl Key {
    #[doc(hidden)]
    pub fn generation_tag(&self) -> u32 {
        self.generation
    }
}

/// Allocation refused because the arena is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("arena full: {capacity} entries in use")]
pub struct ArenaFull {
    pub capacity: usize,
}

/// Sizing of an [`Arena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLimits {
    /// Slots added per growth step
    pub chunk_size: usize,
    /// Free tail chunks kept around after removals
    pub max_free_chunks: usize,
    /// Hard ceiling on live entries
    pub capacity: usize,
}

impl ArenaLimits {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            chunk_size: 256.min(capacity.max(1)),
            max_free_chunks: 4,
            capacity,
        }
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub struct Arena<K, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limits: ArenaLimits,
    /// Generation given to freshly created slots; raised whenever slots are
    /// released so keys into released slots never match again
    fresh_generation: u32,
    _key: PhantomData<K>,
}

impl<K, T> fmt::Debug for Arena<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len)
            .field("slots", &self.slots.len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl<K: ArenaKey, T> Arena<K, T> {
    pub fn new(limits: ArenaLimits) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limits,
            fresh_generation: 0,
            _key: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.limits.capacity
    }

    /// Slots currently backed by storage
    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    pub fn remaining(&self) -> usize {
        self.limits.capacity - self.len
    }

    pub fn insert(&mut self, value: T) -> Result<K, ArenaFull> {
        if self.free.is_empty() {
            self.grow()?;
        }
        let index = self.free.pop().ok_or(ArenaFull {
            capacity: self.limits.capacity,
        })?;

        let slot = &mut self.slots[index as usize];
        let generation = match slot {
            Slot::Vacant { generation } => *generation,
            Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
        };
        *slot = Slot::Occupied { generation, value };
        self.len += 1;

        Ok(K::from_key(Key { index, generation }))
    }

    pub fn remove(&mut self, id: K) -> Option<T> {
        let key = id.key();
        let slot = self.slots.get_mut(key.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }

        let next = Slot::Vacant {
            generation: key.generation.wrapping_add(1),
        };
        let value = match std::mem::replace(slot, next) {
            Slot::Occupied { value, .. } => value,
            Slot::Vacant { .. } => unreachable!(),
        };
        self.free.push(key.index);
        self.len -= 1;
        self.shrink();

        Some(value)
    }

    pub fn get(&self, id: K) -> Option<&T> {
        let key = id.key();
        match self.slots.get(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: K) -> Option<&mut T> {
        let key = id.key();
        match self.slots.get_mut(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, id: K) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, value } => Some((
                K::from_key(Key {
                    index: index as u32,
                    generation: *generation,
                }),
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }

    fn grow(&mut self) -> Result<(), ArenaFull> {
        let current = self.slots.len();
        if current >= self.limits.capacity {
            return Err(ArenaFull {
                capacity: self.limits.capacity,
            });
        }

        let add = self.limits.chunk_size.min(self.limits.capacity - current);
        self.slots.reserve_exact(add);
        for _ in 0..add {
            self.slots.push(Slot::Vacant {
                generation: self.fresh_generation,
            });
        }
        // Lowest index is handed out first.
        self.free.extend((current as u32..(current + add) as u32).rev());
        Ok(())
    }

    fn shrink(&mut self) {
        let trailing = self
            .slots
            .iter()
            .rev()
            .take_while(|slot| matches!(slot, Slot::Vacant { .. }))
            .count();
        let chunk = self.limits.chunk_size.max(1);
        let keep = self.limits.max_free_chunks * chunk;
        if trailing <= keep + chunk {
            return;
        }

        // Release whole chunks only.
        let surplus = (trailing - keep) / chunk * chunk;
        let new_len = self.slots.len() - surplus;
        for slot in &self.slots[new_len..] {
            if let Slot::Vacant { generation } = slot {
                self.fresh_generation = self.fresh_generation.max(generation.wrapping_add(1));
            }
        }
        self.slots.truncate(new_len);
        self.slots.shrink_to_fit();
        self.free.retain(|&index| (index as usize) < new_len);
    }
}
