//! Deferred command storage.
//!
//! Mutations issued while iteration depth is nonzero are appended here
//! instead of being applied immediately (spec.md §4.8). [`RawValue`] is the
//! move-only, type-erased value holder used by `Add` commands so that
//! non-trivially-relocatable component values are moved into the column at
//! flush time rather than cloned through an intermediate representation --
//! grounded on the teacher's `world.rs` `RawComponentBuf`, which plays the
//! same role for bundle assembly there.
//!
//! This redesigns the teacher's `command.rs` wholesale: the teacher stores
//! `serde_json::Value` plus a string component name (built for its
//! WASM/Python dynamic-component use case) and carries causality metadata
//! (`CausalReason`, `SystemId`) that spec.md's command model has no place
//! for. What is kept is the FIFO `Vec`-backed buffer shape and the general
//! "accumulate during a tick, replay in order" discipline.

#![allow(unsafe_code)]

use std::alloc::{alloc, dealloc, Layout};
use std::ptr;

use crate::archetype::ComponentVtable;
use crate::component::ComponentTypeId;
use crate::entity::EntityHandle;

/// An owned, type-erased single value, not yet dropped.
///
/// `Drop` only deallocates the backing buffer -- it does **not** run the
/// value's destructor. Callers must either move the bytes out (e.g. via
/// `Column::push_raw`, a bitwise copy) or explicitly call
/// [`drop_value`](Self::drop_value) first.
pub struct RawValue {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for RawValue {}

impl RawValue {
    pub fn from_value<T: Send + 'static>(value: T) -> Self {
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            std::mem::forget(value);
            return Self { ptr: ptr::NonNull::dangling().as_ptr(), layout };
        }
        unsafe {
            let ptr = alloc(layout);
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            ptr::write(ptr as *mut T, value);
            Self { ptr, layout }
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// # Safety
    /// Must be called at most once, and only if the bytes were not already
    /// moved out elsewhere (e.g. copied into a column via `push_raw`).
    pub unsafe fn drop_value(&mut self, vtable: &ComponentVtable) {
        if self.layout.size() > 0 {
            vtable.drop_value(self.ptr);
        }
    }
}

impl Drop for RawValue {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }
}

// ---------------------------------------------------------------------------
// Deferred commands
// ---------------------------------------------------------------------------

/// One queued mutation (spec.md §3 "Deferred command": `Add{entity, type,
/// bytes}`, `Remove{entity, type}`, `Destroy{entity}`).
pub enum DeferredCommand {
    Add {
        entity: EntityHandle,
        type_id: ComponentTypeId,
        value: RawValue,
    },
    Remove {
        entity: EntityHandle,
        type_id: ComponentTypeId,
    },
    Destroy {
        entity: EntityHandle,
    },
}

/// FIFO queue of mutations accumulated while iteration depth is nonzero.
///
/// Insertion order is preserved across mixed kinds of commands (spec.md
/// §4.8 invariant); flushing replays them in that order against the
/// immediate API.
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<DeferredCommand>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, command: DeferredCommand) {
        self.commands.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Remove and return every queued command, in insertion order.
    pub fn drain(&mut self) -> Vec<DeferredCommand> {
        std::mem::take(&mut self.commands)
    }
}
