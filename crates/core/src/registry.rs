// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::component::{ComponentRef, ComponentType, Linkage, Pollable};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug)]
pub(crate) struct RegistryEntry {
    pub(crate) component: ComponentRef,
    pub(crate) wired: bool,
    pub(crate) relinked: bool,
}

impl RegistryEntry {
    fn new(component: ComponentRef) -> Self {
        Self {
            component,
            wired: false,
            relinked: false,
        }
    }

    pub(crate) fn flag(&self, linkage: Linkage) -> bool {
        match linkage {
            Linkage::Initialise => self.wired,
            Linkage::Relink => self.relinked,
        }
    }

    pub(crate) fn set_flag(&mut self, linkage: Linkage, value: bool) {
        match linkage {
            Linkage::Initialise => self.wired = value,
            Linkage::Relink => self.relinked = value,
        }
    }
}

/// Every component instance that makes up one machine.
///
/// Membership is duplicate free by pointer identity. Iteration order is insertion order,
/// which carries no meaning for wiring.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    entries: Vec<RegistryEntry>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component. Returns `false` if this exact instance is already present.
    pub fn insert(&mut self, component: ComponentRef) -> bool {
        if self.contains(&component) {
            return false;
        }
        self.entries.push(RegistryEntry::new(component));
        true
    }

    /// Construct `component` in place and return its typed handle.
    pub fn add<T: ComponentType>(&mut self, component: T) -> Rc<RefCell<T>> {
        let rc = Rc::new(RefCell::new(component));
        self.insert(ComponentRef::from_rc(rc.clone()));
        rc
    }

    pub fn contains(&self, component: &ComponentRef) -> bool {
        self.entries.iter().any(|e| e.component.ptr_eq(component))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentRef> {
        self.entries.iter().map(|e| &e.component)
    }

    /// First instance of `T` in the registry.
    pub fn find<T: ComponentType>(&self) -> Option<Rc<RefCell<T>>> {
        self.iter().find_map(|c| c.downcast::<T>())
    }

    /// First registered component carrying `type_name`, with the number of matches.
    pub fn find_by_type_name(&self, type_name: &str) -> Option<(ComponentRef, usize)> {
        let mut matches = self.iter().filter(|c| c.type_name() == type_name);
        let first = matches.next()?.clone();
        Some((first, 1 + matches.count()))
    }

    /// `<type-name>#<n>` for every member, `n` counting earlier members of the same type.
    pub fn labels(&self) -> Vec<String> {
        let mut seen: HashMap<&'static str, u32> = HashMap::new();
        self.iter()
            .map(|c| {
                let n = seen.entry(c.type_name()).or_insert(0);
                let label = format!("{}#{}", c.type_name(), n);
                *n += 1;
                label
            })
            .collect()
    }

    pub fn pollables(&self) -> Vec<Rc<RefCell<dyn Pollable>>> {
        self.iter().filter_map(|c| c.pollable().cloned()).collect()
    }

    pub fn is_wired(&self, component: &ComponentRef) -> bool {
        self.entry(component).is_some_and(|e| e.wired)
    }

    pub fn is_relinked(&self, component: &ComponentRef) -> bool {
        self.entry(component).is_some_and(|e| e.relinked)
    }

    pub fn all_wired(&self) -> bool {
        self.entries.iter().all(|e| e.wired)
    }

    pub fn all_relinked(&self) -> bool {
        self.entries.iter().all(|e| e.relinked)
    }

    /// Forget every relink flag so the next relink pass starts from scratch.
    pub(crate) fn clear_relinked(&mut self) {
        for entry in &mut self.entries {
            entry.relinked = false;
        }
    }

    /// Replace membership: `restored` first, in order, then everything else that was
    /// already here. Wired flags of retained members carry over.
    pub(crate) fn reorder_restored(&mut self, restored: &[ComponentRef]) -> Vec<ComponentRef> {
        let old = std::mem::take(&mut self.entries);
        let mut retained = Vec::new();
        let mut rest = Vec::new();
        for entry in old {
            if restored.iter().any(|r| r.ptr_eq(&entry.component)) {
                continue;
            }
            retained.push(entry.component.clone());
            rest.push(entry);
        }
        for component in restored {
            let mut entry = RegistryEntry::new(component.clone());
            entry.wired = true;
            self.entries.push(entry);
        }
        self.entries.extend(rest);
        retained
    }

    pub(crate) fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [RegistryEntry] {
        &mut self.entries
    }

    fn entry(&self, component: &ComponentRef) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.component.ptr_eq(component))
    }
}

impl FromIterator<ComponentRef> for ComponentRegistry {
    fn from_iter<I: IntoIterator<Item = ComponentRef>>(iter: I) -> Self {
        let mut registry = Self::new();
        for component in iter {
            registry.insert(component);
        }
        registry
    }
}
