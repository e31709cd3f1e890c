use std::fmt;

/// Handle into a [`SlotTable`]: a slot index plus the generation it was issued at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity arena with round-robin free-slot search.
///
/// The search starts just after the last allocated index, so churn does not
/// keep rescanning the front of the table. Removing a value bumps the slot
/// generation, which turns every outstanding handle to it stale.
#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    cursor: usize,
    live: usize,
}

impl<T> SlotTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    generation: 0,
                    value: None,
                })
                .collect(),
            cursor: 0,
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn is_full(&self) -> bool {
        self.live >= self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.len() - self.live
    }

    fn find_free(&self) -> Option<usize> {
        let capacity = self.slots.len();
        (0..capacity)
            .map(|i| (self.cursor + i) % capacity)
            .find(|&pos| self.slots[pos].value.is_none())
    }

    pub fn insert(&mut self, value: T) -> Option<SlotId> {
        let pos = self.find_free()?;
        self.cursor = (pos + 1) % self.slots.len();
        self.live += 1;

        let slot = &mut self.slots[pos];
        slot.value = Some(value);
        Some(SlotId {
            index: pos as u32,
            generation: slot.generation,
        })
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        Some(value)
    }

    /// Handle of whatever currently occupies `index`.
    pub fn id_at(&self, index: usize) -> Option<SlotId> {
        let slot = self.slots.get(index)?;
        slot.value.as_ref().map(|_| SlotId {
            index: index as u32,
            generation: slot.generation,
        })
    }

    /// Live handles in index order.
    pub fn ids(&self) -> Vec<SlotId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn live_indices_are_unique() {
        let mut table = SlotTable::with_capacity(8);
        let ids: Vec<SlotId> = (0..8).map(|i| table.insert(i).unwrap()).collect();

        let indices: HashSet<usize> = ids.iter().map(|id| id.index()).collect();
        assert_eq!(indices.len(), 8);
        assert!(table.is_full());
        assert!(table.insert(99).is_none());
    }

    #[test]
    fn allocation_is_round_robin() {
        let mut table = SlotTable::with_capacity(4);
        let a = table.insert('a').unwrap();
        let b = table.insert('b').unwrap();
        table.remove(a);

        // The freed slot 0 is skipped until the scan wraps around.
        let c = table.insert('c').unwrap();
        assert_eq!(c.index(), 2);
        let d = table.insert('d').unwrap();
        assert_eq!(d.index(), 3);
        let e = table.insert('e').unwrap();
        assert_eq!(e.index(), 0);
        assert_eq!(table.get(b), Some(&'b'));
    }

    #[test]
    fn stale_handles_do_not_alias_reused_slots() {
        let mut table = SlotTable::with_capacity(1);
        let old = table.insert("first").unwrap();
        assert_eq!(table.remove(old), Some("first"));

        let new = table.insert("second").unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);

        assert!(table.get(old).is_none());
        assert!(table.remove(old).is_none());
        assert_eq!(table.get(new), Some(&"second"));
    }

    #[test]
    fn ids_are_in_index_order() {
        let mut table = SlotTable::with_capacity(5);
        for i in 0..5 {
            table.insert(i);
        }
        let second = table.id_at(1).unwrap();
        table.remove(second);

        let order: Vec<usize> = table.ids().iter().map(|id| id.index()).collect();
        assert_eq!(order, vec![0, 2, 3, 4]);
        assert_eq!(table.len(), 4);
        assert_eq!(table.free_slots(), 1);
    }
}
