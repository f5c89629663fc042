// 🔢 Index Allocator - stable integer ids per location namespace
//
// Ids are what the persisted tables join on, so once a location has one it
// keeps it: across saves, reloads, and whatever gets added later.

use crate::geo::Location;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Where lenders are
    Lender,

    /// Where borrowers are
    Loan,
}

/// One independent counter plus its location → id map.
#[derive(Debug, Clone, Default, PartialEq)]
struct IdSpace {
    ids: HashMap<Location, u32>,
    taken: HashSet<u32>,
    next: u32,
}

impl IdSpace {
    fn id_for(&mut self, location: &Location) -> (u32, bool) {
        if let Some(&id) = self.ids.get(location) {
            return (id, false);
        }

        let id = self.next;
        self.ids.insert(location.clone(), id);
        self.taken.insert(id);
        self.next += 1;
        (id, true)
    }

    fn register(&mut self, location: Location, id: u32) -> Result<(), String> {
        if let Some(&existing) = self.ids.get(&location) {
            return if existing == id {
                Ok(())
            } else {
                Err(format!("{} already has id {}, not {}", location, existing, id))
            };
        }
        if self.taken.contains(&id) {
            return Err(format!("id {} is already taken", id));
        }
        let after = id.checked_add(1).ok_or_else(|| format!("id {} is out of range", id))?;

        self.ids.insert(location, id);
        self.taken.insert(id);
        self.next = self.next.max(after);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexAllocator {
    lenders: IdSpace,
    loans: IdSpace,
}

impl IndexAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing id for the location, or the next unused one.
    pub fn id_for(&mut self, location: &Location, namespace: Namespace) -> u32 {
        self.allocate(location, namespace).0
    }

    /// Like `id_for`, also reporting whether the id was just created.
    pub fn allocate(&mut self, location: &Location, namespace: Namespace) -> (u32, bool) {
        self.space_mut(namespace).id_for(location)
    }

    /// Re-bind an id read back from disk. Conflicting bindings are rejected.
    pub fn register(&mut self, location: Location, id: u32, namespace: Namespace) -> Result<(), String> {
        self.space_mut(namespace).register(location, id)
    }

    pub fn get(&self, location: &Location, namespace: Namespace) -> Option<u32> {
        self.space(namespace).ids.get(location).copied()
    }

    /// The id the next new location in this namespace would receive
    pub fn next_id(&self, namespace: Namespace) -> u32 {
        self.space(namespace).next
    }

    fn space(&self, namespace: Namespace) -> &IdSpace {
        match namespace {
            Namespace::Lender => &self.lenders,
            Namespace::Loan => &self.loans,
        }
    }

    fn space_mut(&mut self, namespace: Namespace) -> &mut IdSpace {
        match namespace {
            Namespace::Lender => &mut self.lenders,
            Namespace::Loan => &mut self.loans,
        }
    }
}
