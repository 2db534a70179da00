//! Object registries
//!
//! [`ObjectMap`] is the per-connection id table. Every entry records its
//! interface and, for objects created on behalf of another object, its
//! parent. Destroying an object cascades to its children. Ids are never
//! handed out twice during a connection's lifetime.
//!
//! [`GlobalRegistry`] holds the process-wide globals advertised through
//! `wl_registry`. Globals have no owning connection and clients cannot
//! destroy them.

use std::collections::{HashMap, HashSet};

use log::trace;
use thiserror::Error;

use crate::protocol::Interface;

/// Id of `wl_display` in every connection
pub const DISPLAY_ID: u32 = 1;

/// First id of the server-allocated range
pub const SERVER_ID_START: u32 = 0xff00_0000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown object {0}")]
    UnknownObject(u32),

    #[error("object {id} is a {actual}, expected {expected}")]
    WrongInterface {
        id: u32,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("id {0} is already in use or was used before")]
    DuplicateId(u32),

    #[error("id {0} is outside the client id range")]
    InvalidId(u32),
}

/// A live entry of an [`ObjectMap`]
#[derive(Debug)]
pub struct Entry<T> {
    pub interface: Interface,
    pub version: u32,
    pub parent: Option<u32>,
    children: Vec<u32>,
    pub data: T,
}

/// An object removed by [`ObjectMap::destroy`] or [`ObjectMap::clear`]
#[derive(Debug)]
pub struct Removed<T> {
    pub id: u32,
    pub interface: Interface,
    pub data: T,
}

/// Per-connection object table with ownership edges
#[derive(Debug)]
pub struct ObjectMap<T> {
    objects: HashMap<u32, Entry<T>>,
    retired: HashSet<u32>,
}

impl<T> Default for ObjectMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectMap<T> {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            retired: HashSet::new(),
        }
    }

    fn check_new(&self, id: u32) -> Result<(), RegistryError> {
        if id == 0 || id >= SERVER_ID_START {
            return Err(RegistryError::InvalidId(id));
        }
        if self.objects.contains_key(&id) || self.retired.contains(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        Ok(())
    }

    /// Registers a new top-level object
    pub fn allocate(
        &mut self,
        id: u32,
        interface: Interface,
        version: u32,
        data: T,
    ) -> Result<(), RegistryError> {
        self.check_new(id)?;
        trace!("allocate {}@{} v{}", interface.name(), id, version);
        self.objects.insert(
            id,
            Entry {
                interface,
                version,
                parent: None,
                children: Vec::new(),
                data,
            },
        );
        Ok(())
    }

    /// Registers a new object owned by `parent`; destroying the parent
    /// destroys it too
    pub fn allocate_child(
        &mut self,
        id: u32,
        interface: Interface,
        version: u32,
        parent: u32,
        data: T,
    ) -> Result<(), RegistryError> {
        self.check_new(id)?;
        let owner = self
            .objects
            .get_mut(&parent)
            .ok_or(RegistryError::UnknownObject(parent))?;
        owner.children.push(id);
        trace!(
            "allocate {}@{} v{} owned by {}",
            interface.name(),
            id,
            version,
            parent
        );
        self.objects.insert(
            id,
            Entry {
                interface,
                version,
                parent: Some(parent),
                children: Vec::new(),
                data,
            },
        );
        Ok(())
    }

    /// Returns the object's payload if it exists and implements `interface`
    pub fn lookup(&self, id: u32, interface: Interface) -> Result<&T, RegistryError> {
        let entry = self.objects.get(&id).ok_or(RegistryError::UnknownObject(id))?;
        if entry.interface != interface {
            return Err(RegistryError::WrongInterface {
                id,
                expected: interface.name(),
                actual: entry.interface.name(),
            });
        }
        Ok(&entry.data)
    }

    pub fn lookup_mut(&mut self, id: u32, interface: Interface) -> Result<&mut T, RegistryError> {
        let entry = self
            .objects
            .get_mut(&id)
            .ok_or(RegistryError::UnknownObject(id))?;
        if entry.interface != interface {
            return Err(RegistryError::WrongInterface {
                id,
                expected: interface.name(),
                actual: entry.interface.name(),
            });
        }
        Ok(&mut entry.data)
    }

    pub fn kind_of(&self, id: u32) -> Option<Interface> {
        self.objects.get(&id).map(|e| e.interface)
    }

    pub fn get(&self, id: u32) -> Option<&Entry<T>> {
        self.objects.get(&id)
    }

    /// Live objects in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Entry<T>)> {
        self.objects.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn children(&self, id: u32) -> &[u32] {
        self.objects
            .get(&id)
            .map(|e| e.children.as_slice())
            .unwrap_or(&[])
    }

    /// Removes `id` and everything it owns, children first
    pub fn destroy(&mut self, id: u32) -> Result<Vec<Removed<T>>, RegistryError> {
        let parent = self
            .objects
            .get(&id)
            .ok_or(RegistryError::UnknownObject(id))?
            .parent;
        if let Some(owner) = parent.and_then(|p| self.objects.get_mut(&p)) {
            owner.children.retain(|c| *c != id);
        }

        let mut removed = Vec::new();
        self.remove_tree(id, &mut removed);
        Ok(removed)
    }

    fn remove_tree(&mut self, id: u32, removed: &mut Vec<Removed<T>>) {
        let Some(entry) = self.objects.remove(&id) else {
            return;
        };
        for child in &entry.children {
            self.remove_tree(*child, removed);
        }
        trace!("destroy {}@{}", entry.interface.name(), id);
        self.retired.insert(id);
        removed.push(Removed {
            id,
            interface: entry.interface,
            data: entry.data,
        });
    }

    /// Removes every object, used when the connection goes away
    pub fn clear(&mut self) -> Vec<Removed<T>> {
        let mut ids: Vec<u32> = self.objects.keys().copied().collect();
        ids.sort_unstable();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            self.remove_tree(id, &mut removed);
        }
        removed
    }

    pub fn is_retired(&self, id: u32) -> bool {
        self.retired.contains(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// A global advertised to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Global {
    pub name: u32,
    pub interface: Interface,
    pub version: u32,
}

/// Process-wide list of globals, in advertisement order
#[derive(Debug, Default)]
pub struct GlobalRegistry {
    globals: Vec<Global>,
    next_name: u32,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        Self {
            globals: Vec::new(),
            next_name: 1,
        }
    }

    /// Adds a global and returns its name
    pub fn add(&mut self, interface: Interface) -> u32 {
        let name = self.next_name;
        self.next_name += 1;
        self.globals.push(Global {
            name,
            interface,
            version: interface.version(),
        });
        name
    }

    pub fn get(&self, name: u32) -> Option<Global> {
        self.globals.iter().find(|g| g.name == name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Global> {
        self.globals.iter()
    }

    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> ObjectMap<&'static str> {
        let mut map = ObjectMap::new();
        map.allocate(DISPLAY_ID, Interface::Display, 1, "display").unwrap();
        map
    }

    #[test]
    fn test_allocate_and_lookup() {
        let mut map = map();
        map.allocate(3, Interface::Surface, 5, "surface").unwrap();

        assert_eq!(map.lookup(3, Interface::Surface), Ok(&"surface"));
        assert_eq!(map.kind_of(3), Some(Interface::Surface));
        assert_eq!(
            map.lookup(3, Interface::Buffer),
            Err(RegistryError::WrongInterface {
                id: 3,
                expected: "wl_buffer",
                actual: "wl_surface"
            })
        );
        assert_eq!(
            map.lookup(4, Interface::Surface),
            Err(RegistryError::UnknownObject(4))
        );
    }

    #[test]
    fn test_duplicate_and_invalid_ids() {
        let mut map = map();
        map.allocate(3, Interface::Region, 1, "region").unwrap();
        assert_eq!(
            map.allocate(3, Interface::Region, 1, "again"),
            Err(RegistryError::DuplicateId(3))
        );
        assert_eq!(
            map.allocate(0, Interface::Region, 1, "zero"),
            Err(RegistryError::InvalidId(0))
        );
        assert_eq!(
            map.allocate(SERVER_ID_START, Interface::Region, 1, "server"),
            Err(RegistryError::InvalidId(SERVER_ID_START))
        );
    }

    #[test]
    fn test_retired_ids_are_not_reused() {
        let mut map = map();
        map.allocate(7, Interface::Region, 1, "region").unwrap();
        map.destroy(7).unwrap();
        assert!(map.is_retired(7));
        assert_eq!(
            map.allocate(7, Interface::Region, 1, "region"),
            Err(RegistryError::DuplicateId(7))
        );
    }

    #[test]
    fn test_destroy_cascades_to_children() {
        let mut map = map();
        map.allocate(5, Interface::Surface, 5, "surface").unwrap();
        map.allocate_child(10, Interface::Callback, 1, 5, "cb1").unwrap();
        map.allocate_child(11, Interface::Callback, 1, 5, "cb2").unwrap();
        map.allocate(12, Interface::Callback, 1, "sync").unwrap();

        let removed = map.destroy(5).unwrap();
        let ids: Vec<u32> = removed.iter().map(|r| r.id).collect();

        assert_eq!(ids, vec![10, 11, 5]);
        assert!(!map.contains(10));
        assert!(!map.contains(11));
        assert!(map.contains(12));
    }

    #[test]
    fn test_destroyed_child_is_unlinked_from_parent() {
        let mut map = map();
        map.allocate(5, Interface::Surface, 5, "surface").unwrap();
        map.allocate_child(10, Interface::Callback, 1, 5, "cb").unwrap();
        map.destroy(10).unwrap();

        assert!(map.children(5).is_empty());
        assert_eq!(map.destroy(5).unwrap().len(), 1);
    }

    #[test]
    fn test_child_of_unknown_parent() {
        let mut map = map();
        assert_eq!(
            map.allocate_child(10, Interface::Callback, 1, 99, "cb"),
            Err(RegistryError::UnknownObject(99))
        );
    }

    #[test]
    fn test_clear_returns_everything() {
        let mut map = map();
        map.allocate(5, Interface::Surface, 5, "surface").unwrap();
        map.allocate_child(10, Interface::Callback, 1, 5, "cb").unwrap();
        let removed = map.clear();
        assert_eq!(removed.len(), 3);
        assert!(map.is_empty());
    }

    #[test]
    fn test_global_registry() {
        let mut globals = GlobalRegistry::new();
        let compositor = globals.add(Interface::Compositor);
        let output = globals.add(Interface::Output);

        assert_eq!(compositor, 1);
        assert_eq!(output, 2);
        assert_eq!(globals.get(output).unwrap().version, 3);
        assert!(globals.get(9).is_none());
        assert_eq!(globals.iter().count(), 2);
    }
}
