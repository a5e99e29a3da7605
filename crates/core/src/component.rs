// Machina - PC Machine Orchestrator
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! The contract every hardware unit of a machine satisfies.
//!
//! A component never owns another component. During wiring it is *offered* every
//! member of the registry and keeps shared handles to the ones it depends on.

use crate::bus::IoPortCapable;
use crate::SimResult;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::io::{Read, Write};
use std::rc::Rc;

/// Which of the two wiring passes is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// First-time wiring right after construction.
    Initialise,
    /// Rebuilding transient handles after a snapshot restore.
    Relink,
}

/// A unit that can be periodically drained for inbound host-side work.
///
/// `poll` must never block. It returns how many work items were surfaced to the guest.
pub trait Pollable {
    fn poll(&mut self) -> usize;
}

/// Trait representing a schedulable hardware unit.
pub trait Component: Any {
    /// Return the component to its power-on state. Collaborator handles are kept.
    fn reset(&mut self);

    /// Inspect `offer` and retain a handle to it if it is something this component needs.
    ///
    /// Must be idempotent. Only offers of other types may be borrowed: every component
    /// is also offered to itself while it is mutably borrowed.
    fn accept(&mut self, offer: &Offer<'_>);

    /// True once every collaborator this component needs has been captured.
    fn is_wired(&self) -> bool;

    /// Restore-time counterpart of [`Component::accept`].
    fn relink(&mut self, offer: &Offer<'_>) {
        self.accept(offer);
    }

    /// Restore-time counterpart of [`Component::is_wired`].
    fn is_relinked(&self) -> bool {
        self.is_wired()
    }

    /// Write this component's own state. References to other components are never written.
    fn save_state(&self, out: &mut dyn Write) -> SimResult<()>;

    fn load_state(&mut self, input: &mut dyn Read) -> SimResult<()>;
}

/// Statically named component kinds.
///
/// `TYPE_NAME` is the stable, fully qualified name used in snapshot labels. The hooks
/// expose optional capabilities as shared trait-object handles to the same allocation.
pub trait ComponentType: Component + Sized {
    const TYPE_NAME: &'static str;

    fn io_port_capable(_this: &Rc<RefCell<Self>>) -> Option<Rc<RefCell<dyn IoPortCapable>>> {
        None
    }

    fn pollable(_this: &Rc<RefCell<Self>>) -> Option<Rc<RefCell<dyn Pollable>>> {
        None
    }
}

/// Shared handle to one component instance.
///
/// Equality is pointer identity. The handle keeps typed, dynamic and capability views of
/// the same `Rc` allocation so a collaborator can be recovered by concrete type.
#[derive(Clone)]
pub struct ComponentRef {
    type_name: &'static str,
    component: Rc<RefCell<dyn Component>>,
    typed: Rc<dyn Any>,
    io: Option<Rc<RefCell<dyn IoPortCapable>>>,
    pollable: Option<Rc<RefCell<dyn Pollable>>>,
}

impl ComponentRef {
    pub fn new<T: ComponentType>(component: T) -> Self {
        Self::from_rc(Rc::new(RefCell::new(component)))
    }

    pub fn from_rc<T: ComponentType>(rc: Rc<RefCell<T>>) -> Self {
        let io = T::io_port_capable(&rc);
        let pollable = T::pollable(&rc);
        let typed: Rc<dyn Any> = rc.clone();
        Self {
            type_name: T::TYPE_NAME,
            component: rc,
            typed,
            io,
            pollable,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn component(&self) -> &Rc<RefCell<dyn Component>> {
        &self.component
    }

    /// Recover the concrete handle if this component is a `T`.
    pub fn downcast<T: ComponentType>(&self) -> Option<Rc<RefCell<T>>> {
        self.typed.clone().downcast::<RefCell<T>>().ok()
    }

    pub fn is<T: ComponentType>(&self) -> bool {
        self.typed.is::<RefCell<T>>()
    }

    pub fn io_port_capable(&self) -> Option<&Rc<RefCell<dyn IoPortCapable>>> {
        self.io.as_ref()
    }

    pub fn pollable(&self) -> Option<&Rc<RefCell<dyn Pollable>>> {
        self.pollable.as_ref()
    }

    pub fn ptr_eq(&self, other: &ComponentRef) -> bool {
        Rc::ptr_eq(&self.typed, &other.typed)
    }
}

impl PartialEq for ComponentRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ComponentRef {}

impl fmt::Debug for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRef")
            .field("type_name", &self.type_name)
            .field("ptr", &Rc::as_ptr(&self.typed).cast::<()>())
            .finish()
    }
}

/// One component presented to another during a wiring round.
///
/// `ready` is the offered component's wired (or relinked) flag as it stood when the
/// round began.
pub struct Offer<'a> {
    component: &'a ComponentRef,
    ready: bool,
}

impl<'a> Offer<'a> {
    pub fn new(component: &'a ComponentRef, ready: bool) -> Self {
        Self { component, ready }
    }

    pub fn component(&self) -> &'a ComponentRef {
        self.component
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The offered component as a `T`, whatever its readiness.
    pub fn get<T: ComponentType>(&self) -> Option<Rc<RefCell<T>>> {
        self.component.downcast::<T>()
    }

    /// The offered component as a `T`, only once it is itself wired.
    pub fn get_ready<T: ComponentType>(&self) -> Option<Rc<RefCell<T>>> {
        if self.ready {
            self.get::<T>()
        } else {
            None
        }
    }
}
