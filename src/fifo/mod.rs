//! Wait-free cross-thread function fifo.
//!
//! Any thread may enqueue callables; only the owning loop thread consumes
//! them. The ring holds `65536 / 64 = 1024` fixed 64-byte slots addressed by
//! a byte-granular 16-bit producer head: a relaxed `fetch_add` of the slot
//! size reserves a slot, and the natural 16-bit wraparound is the ring
//! arithmetic. Per-slot release/acquire on the slot's pointer is the only
//! producer/consumer synchronisation.
//!
//! A push is wait-free as long as the reserved slot has been vacated, i.e.
//! unless the consumer has fallen a full ring behind; in that case the
//! producer spins, yields once and then backs off with a short sleep, and the
//! contention counter records the stall.

mod runnable;

pub use runnable::SendFuture;
pub(crate) use runnable::{PostRunnable, Runnable, SendRunnable, panic_message};

use crossbeam_utils::CachePadded;

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU16, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// Slot granularity in bytes. The head counter advances by this amount.
const SLOT_SIZE: usize = 64;

/// Number of slots; the 16-bit byte index wraps exactly onto the ring.
const SLOT_COUNT: usize = (u16::MAX as usize + 1) / SLOT_SIZE;

/// Inline payload capacity of a slot, after the slot's own pointer.
const INLINE_SIZE: usize = SLOT_SIZE - mem::size_of::<*mut Header>();

/// Alignment of the inline buffer within a slot.
const INLINE_ALIGN: usize = mem::align_of::<*mut Header>();

/// Backoff sleep applied while a producer waits on a still-occupied slot.
const BACKOFF_SLEEP: Duration = Duration::from_micros(100);

/// Erased runnable header: two trampolines stored in front of the payload.
///
/// No vtable is involved; `call` and `discard` are monomorphised per concrete
/// runnable and know whether the payload is inline or heap-allocated.
#[repr(C)]
struct Header {
    /// Runs the runnable and destroys it. For heap runnables this also frees
    /// the allocation. Must be called at most once.
    call: unsafe fn(*mut Header),
    /// Destroys the runnable without running it. Same ownership rules.
    discard: unsafe fn(*mut Header),
}

/// A concrete runnable prefixed by its erased header.
#[repr(C)]
struct Packed<R> {
    header: Header,
    runnable: R,
}

unsafe fn inline_call<R: Runnable>(header: *mut Header) {
    // SAFETY: the packed runnable was placement-constructed in the slot and
    // is read out exactly once; the slot memory itself is not freed.
    let runnable = unsafe { ptr::read(ptr::addr_of!((*header.cast::<Packed<R>>()).runnable)) };
    runnable.run();
}

unsafe fn inline_discard<R: Runnable>(header: *mut Header) {
    unsafe { ptr::drop_in_place(ptr::addr_of_mut!((*header.cast::<Packed<R>>()).runnable)) };
}

unsafe fn heap_call<R: Runnable>(header: *mut Header) {
    // SAFETY: the pointer originated from `Box::into_raw` in `emplace`.
    let packed = unsafe { *Box::from_raw(header.cast::<Packed<R>>()) };
    packed.runnable.run();
}

unsafe fn heap_discard<R: Runnable>(header: *mut Header) {
    drop(unsafe { Box::from_raw(header.cast::<Packed<R>>()) });
}

/// True when `R`, together with its header, fits a slot's inline buffer.
const fn fits_inline<R>() -> bool {
    mem::size_of::<Packed<R>>() <= INLINE_SIZE && mem::align_of::<Packed<R>>() <= INLINE_ALIGN
}

/// One fifo cell: the atomically-owned message pointer plus the inline buffer.
///
/// `message` is null while the slot is empty. The producer transitions
/// empty→filled with a release store after constructing the runnable; the
/// consumer transitions filled→empty with a release store after running and
/// destroying it.
#[repr(C, align(64))]
struct Slot {
    message: AtomicPtr<Header>,
    buffer: UnsafeCell<[MaybeUninit<u8>; INLINE_SIZE]>,
}

const _: () = assert!(mem::size_of::<Slot>() == SLOT_SIZE);

impl Slot {
    fn new() -> Self {
        Self {
            message: AtomicPtr::new(ptr::null_mut()),
            buffer: UnsafeCell::new([MaybeUninit::uninit(); INLINE_SIZE]),
        }
    }
}

/// The wait-free function fifo.
///
/// Many threads produce, exactly one thread (the owning loop) consumes.
pub(crate) struct FunctionFifo {
    slots: Box<[Slot]>,

    /// Producer cursor: a byte index into the 65536-byte ring, advanced by
    /// [`SLOT_SIZE`] per reservation. Wraps intentionally.
    head: CachePadded<AtomicU16>,

    /// Consumer cursor, touched only by the owning loop thread.
    tail: CachePadded<UnsafeCell<u16>>,

    /// Number of pushes that found their reserved slot still occupied.
    contention: AtomicU64,
}

// SAFETY: producers only touch `head`, `contention` and the per-slot atomics;
// the plain `tail` cursor and the inline buffers are owned by the single
// consumer thread, which is the contract of `take_one` and `is_empty`.
unsafe impl Send for FunctionFifo {}
unsafe impl Sync for FunctionFifo {}

impl FunctionFifo {
    pub(crate) fn new() -> Self {
        let slots = (0..SLOT_COUNT).map(|_| Slot::new()).collect::<Vec<_>>();

        Self {
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicU16::new(0)),
            tail: CachePadded::new(UnsafeCell::new(0)),
            contention: AtomicU64::new(0),
        }
    }

    /// Enqueues a plain closure.
    pub(crate) fn post<F>(&self, function: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.emplace(PostRunnable(function));
    }

    /// Enqueues a closure and returns a future for its result.
    pub(crate) fn send<F, T>(&self, function: F) -> SendFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (runnable, future) = SendRunnable::new(function);
        self.emplace(runnable);
        future
    }

    /// Reserves a slot and constructs `runnable` into it.
    ///
    /// Runnables that fit the inline buffer (size and alignment) are
    /// placement-constructed in the slot; larger ones are heap-allocated.
    fn emplace<R>(&self, runnable: R)
    where
        R: Runnable + 'static,
    {
        let index = self.head.fetch_add(SLOT_SIZE as u16, Ordering::Relaxed);
        let slot = &self.slots[index as usize / SLOT_SIZE];

        // Wait for the consumer to vacate the slot. This only happens when
        // producers are a full ring ahead of the consumer.
        let mut spins = 0u32;
        while !slot.message.load(Ordering::Acquire).is_null() {
            match spins {
                0 => {
                    self.contention.fetch_add(1, Ordering::Relaxed);
                    std::hint::spin_loop();
                }
                1..32 => std::hint::spin_loop(),
                32 => thread::yield_now(),
                _ => thread::sleep(BACKOFF_SLEEP),
            }
            spins += 1;
        }

        let header = if fits_inline::<R>() {
            let packed = slot.buffer.get().cast::<Packed<R>>();
            // SAFETY: the slot is empty (pointer observed null with acquire),
            // so the inline buffer is unused; size and alignment were checked.
            unsafe {
                packed.write(Packed {
                    header: Header {
                        call: inline_call::<R>,
                        discard: inline_discard::<R>,
                    },
                    runnable,
                });
            }
            packed.cast::<Header>()
        } else {
            Box::into_raw(Box::new(Packed {
                header: Header {
                    call: heap_call::<R>,
                    discard: heap_discard::<R>,
                },
                runnable,
            }))
            .cast::<Header>()
        };

        slot.message.store(header, Ordering::Release);
    }

    /// Pops the runnable at the tail, if any, handing it to `op`.
    ///
    /// `op` either runs the runnable or lets it drop unrun; either way it is
    /// destroyed before `take_one` returns, and `op` must not unwind (the
    /// loop catches callback panics inside `op`).
    ///
    /// # Safety
    ///
    /// Must only be called from the single consumer thread.
    pub(crate) unsafe fn take_one<F>(&self, op: F) -> bool
    where
        F: FnOnce(TakenRunnable<'_>),
    {
        let tail = unsafe { *self.tail.get() };
        let slot = &self.slots[tail as usize / SLOT_SIZE];

        let header = slot.message.load(Ordering::Acquire);
        if header.is_null() {
            return false;
        }

        op(TakenRunnable {
            header,
            _fifo: PhantomData,
        });

        slot.message.store(ptr::null_mut(), Ordering::Release);
        unsafe { *self.tail.get() = tail.wrapping_add(SLOT_SIZE as u16) };

        true
    }

    /// Consumer-side emptiness check.
    ///
    /// # Safety
    ///
    /// Must only be called from the single consumer thread.
    pub(crate) unsafe fn is_empty(&self) -> bool {
        let tail = unsafe { *self.tail.get() };
        let slot = &self.slots[tail as usize / SLOT_SIZE];
        slot.message.load(Ordering::Acquire).is_null()
    }

    /// Number of pushes that had to wait for a slot.
    pub(crate) fn contention_count(&self) -> u64 {
        self.contention.load(Ordering::Relaxed)
    }
}

impl Drop for FunctionFifo {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves exclusive access; remaining runnables
        // are destroyed without running.
        unsafe { while self.take_one(|r| drop(r)) {} }
    }
}

/// An erased runnable handed out by [`FunctionFifo::take_one`].
///
/// [`run`](TakenRunnable::run) invokes and destroys it; merely dropping the
/// handle destroys it without running.
pub(crate) struct TakenRunnable<'a> {
    header: *mut Header,
    _fifo: PhantomData<&'a FunctionFifo>,
}

impl TakenRunnable<'_> {
    pub(crate) fn run(self) {
        let header = self.header;
        mem::forget(self);
        // SAFETY: the header pointer came from the slot and is consumed
        // exactly once.
        unsafe { ((*header).call)(header) };
    }
}

impl Drop for TakenRunnable<'_> {
    fn drop(&mut self) {
        // SAFETY: as in `run`; the discard trampoline consumes the runnable.
        unsafe { ((*self.header).discard)(self.header) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn drain(fifo: &FunctionFifo) -> usize {
        let mut count = 0;
        while unsafe { fifo.take_one(|r| r.run()) } {
            count += 1;
        }
        count
    }

    #[test]
    fn posts_run_in_order() {
        let fifo = FunctionFifo::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = seen.clone();
            fifo.post(move || seen.lock().unwrap().push(i));
        }

        assert_eq!(drain(&fifo), 10);
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn wraps_around_the_ring() {
        let fifo = FunctionFifo::new();
        let counter = Arc::new(AtomicUsize::new(0));

        // Three full rings worth of traffic through the 16-bit index.
        for _ in 0..3 {
            for _ in 0..SLOT_COUNT {
                let counter = counter.clone();
                fifo.post(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            assert_eq!(drain(&fifo), SLOT_COUNT);
        }

        assert_eq!(counter.load(Ordering::Relaxed), 3 * SLOT_COUNT);
    }

    #[test]
    fn large_closures_go_through_the_heap() {
        let fifo = FunctionFifo::new();
        let payload = [7u8; 512];
        let sum = Arc::new(AtomicUsize::new(0));

        let sum2 = sum.clone();
        fifo.post(move || {
            sum2.fetch_add(payload.iter().map(|b| *b as usize).sum(), Ordering::Relaxed);
        });

        assert_eq!(drain(&fifo), 1);
        assert_eq!(sum.load(Ordering::Relaxed), 7 * 512);
    }

    #[test]
    fn unconsumed_runnables_are_destroyed_on_drop() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let fifo = FunctionFifo::new();

        for _ in 0..5 {
            let guard = Guard(drops.clone());
            fifo.post(move || {
                let _keep = &guard;
                panic!("must never run");
            });
        }

        drop(fifo);
        assert_eq!(drops.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn send_delivers_the_result() {
        let fifo = FunctionFifo::new();
        let future = fifo.send(|| 6 * 7);

        assert!(!future.is_ready());
        assert_eq!(drain(&fifo), 1);
        assert_eq!(future.wait(), 42);
    }
}
