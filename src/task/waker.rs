//! Waker integration for loop tasks.
//!
//! The waker is an `Arc<TaskCore<T>>` behind a raw vtable; waking posts a
//! poll runnable through the task's owning loop, so waking is safe from any
//! thread.

use crate::task::core::TaskCore;

use std::mem;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

fn vtable<T: Send + 'static>() -> &'static RawWakerVTable {
    &RawWakerVTable::new(
        clone_raw::<T>,
        wake_raw::<T>,
        wake_by_ref_raw::<T>,
        drop_raw::<T>,
    )
}

/// Creates the [`Waker`] for a task.
///
/// The raw pointer originates from `Arc::into_raw`; every vtable entry
/// restores the `Arc` and keeps the reference count balanced.
pub(crate) fn make_waker<T: Send + 'static>(task: Arc<TaskCore<T>>) -> Waker {
    unsafe { Waker::from_raw(RawWaker::new(Arc::into_raw(task) as *const (), vtable::<T>())) }
}

fn clone_raw<T: Send + 'static>(ptr: *const ()) -> RawWaker {
    let task = unsafe { Arc::<TaskCore<T>>::from_raw(ptr as *const TaskCore<T>) };
    let cloned = task.clone();
    mem::forget(task);

    RawWaker::new(Arc::into_raw(cloned) as *const (), vtable::<T>())
}

fn wake_raw<T: Send + 'static>(ptr: *const ()) {
    let task = unsafe { Arc::<TaskCore<T>>::from_raw(ptr as *const TaskCore<T>) };
    task.wake();
}

fn wake_by_ref_raw<T: Send + 'static>(ptr: *const ()) {
    let task = unsafe { Arc::<TaskCore<T>>::from_raw(ptr as *const TaskCore<T>) };
    task.wake();
    mem::forget(task);
}

fn drop_raw<T: Send + 'static>(ptr: *const ()) {
    drop(unsafe { Arc::<TaskCore<T>>::from_raw(ptr as *const TaskCore<T>) });
}
