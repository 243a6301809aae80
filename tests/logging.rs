//! The global allocator must not call into the logger while its lock is held:
//! typical loggers format their records into a `String`, which allocates and
//! would spin forever on the lock of the very same allocator.
use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

#[global_allocator]
static ALLOCATOR: halffit::Allocator<{ 1024 * 1024 }> = halffit::Allocator::new();

/// A logger formatting every record into a freshly allocated string.
struct FormattingLogger {
    records: AtomicUsize,
    bytes: AtomicUsize,
}
impl log::Log for FormattingLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let line = format!("[{}] {}", record.level(), record.args());
        self.bytes.fetch_add(line.len(), Ordering::Relaxed);
        self.records.fetch_add(1, Ordering::Relaxed);
    }

    fn flush(&self) {}
}

static LOGGER: FormattingLogger = FormattingLogger {
    records: AtomicUsize::new(0),
    bytes: AtomicUsize::new(0),
};

#[test]
fn allocating_logger_does_not_deadlock() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(log::LevelFilter::Trace);

    let mut v = Vec::with_capacity(100);
    v.extend(0..1000_u32);
    assert_eq!(v.iter().sum::<u32>(), 999 * 1000 / 2);
    drop(v);

    // A failed release is reported through the logger, which allocates.
    let mut outside = 0_u64;
    let outside = NonNull::from(&mut outside).cast::<u8>();
    let before = LOGGER.records.load(Ordering::Relaxed);
    unsafe { ALLOCATOR.dealloc(outside.as_ptr(), Layout::new::<u64>()) };
    assert!(LOGGER.records.load(Ordering::Relaxed) > before);
    assert!(LOGGER.bytes.load(Ordering::Relaxed) > 0);

    let stats = ALLOCATOR.stats();
    assert_eq!(
        stats.used_bytes + stats.free_bytes + stats.overhead_bytes,
        stats.arena_size
    );
}
