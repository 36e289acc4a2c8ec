use std::ffi::CStr;
use std::fs::File;
use std::hint::black_box;
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_int, c_void, read, size_t, sprintf, ssize_t};
use parking_lot::Mutex;
use scopehook::{
    active_hooks, declare_hookable, hook_slot, install_hook, replace_hook, suppress_hook, HookSlot,
    ScopedHookInstall, SlotStatus,
};

/// Serialises tests that patch the same functions
static SERIAL: Mutex<()> = Mutex::new(());

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[inline(never)]
#[no_mangle]
extern "C" fn hooks_test_scale(x: c_int) -> c_int {
    let mut acc = black_box(x);
    for i in 0..black_box(4) {
        acc = acc.wrapping_mul(2).wrapping_add(i);
    }
    acc
}

#[inline(never)]
#[no_mangle]
extern "C" fn hooks_test_offset(x: c_int) -> c_int {
    let mut acc = black_box(x);
    for i in 0..black_box(2) {
        acc = acc.wrapping_add(100).wrapping_sub(i);
    }
    acc
}

#[inline(never)]
#[no_mangle]
extern "C" fn hooks_test_empty() {}

extern "C" fn negate(x: c_int) -> c_int {
    black_box(-x)
}

extern "C" fn square(x: c_int) -> c_int {
    black_box(x * x)
}

extern "C" fn zero(_x: c_int) -> c_int {
    black_box(0)
}

extern "C" fn nothing() {}

declare_hookable!(hooks_test_scale, hooks_test_offset, hooks_test_empty, sprintf, read);

/// First bytes of a function, enough to cover any trampoline
fn entry(f: *const ()) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(f as *const u8, 16) }.to_vec()
}

/// Calls through an opaque pointer so the patched entry is always used
fn scale(x: c_int) -> c_int {
    black_box(hooks_test_scale as extern "C" fn(c_int) -> c_int)(x)
}

/// Calls through an opaque pointer so the patched entry is always used
fn offset(x: c_int) -> c_int {
    black_box(hooks_test_offset as extern "C" fn(c_int) -> c_int)(x)
}

static STUB_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn fake_sprintf(buf: *mut c_char, _format: *const c_char) -> c_int {
    suppress_hook!(sprintf);
    STUB_CALLS.fetch_add(1, Ordering::Relaxed);
    sprintf(buf, c"%s/%s".as_ptr(), c"foo".as_ptr(), c"bar".as_ptr());
    10
}

#[test]
fn sprintf_stub_reaches_real_sprintf() {
    init_tracing();
    let _serial = SERIAL.lock();
    let mut buf = [0 as c_char; 32];

    {
        let _hook = unsafe { install_hook!(sprintf, fake_sprintf) };
        assert_eq!(hook_slot!(sprintf).status(), SlotStatus::Active);

        let ret = unsafe { sprintf(buf.as_mut_ptr(), c"%d".as_ptr(), 42) };
        assert_eq!(ret, 10);
        assert_eq!(unsafe { CStr::from_ptr(buf.as_ptr()) }, c"foo/bar");
        // the stub's suppressor has been dropped again
        assert_eq!(hook_slot!(sprintf).status(), SlotStatus::Active);

        unsafe { sprintf(buf.as_mut_ptr(), c"%d".as_ptr(), 7) };
        assert_eq!(STUB_CALLS.load(Ordering::Relaxed), 2);
    }

    assert_eq!(hook_slot!(sprintf).status(), SlotStatus::Empty);
    let ret = unsafe { sprintf(buf.as_mut_ptr(), c"%d".as_ptr(), 42) };
    assert_eq!(ret, 2);
    assert_eq!(unsafe { CStr::from_ptr(buf.as_ptr()) }, c"42");
}

#[test]
fn replace_many_times_then_restore() {
    init_tracing();
    let _serial = SERIAL.lock();
    let real = scale(3);
    let before = entry(hooks_test_scale as *const ());

    {
        let hook = unsafe { install_hook!(hooks_test_scale, negate) };
        assert_eq!(scale(3), -3);
        assert_ne!(entry(hooks_test_scale as *const ()), before);
        for _ in 0..16 {
            unsafe { replace_hook!(hook, square) };
            assert_eq!(scale(3), 9);
            unsafe { replace_hook!(hook, negate) };
            assert_eq!(scale(3), -3);
        }
        assert_eq!(hook.replacement(), negate as *const ());
    }

    assert_eq!(entry(hooks_test_scale as *const ()), before);
    assert_eq!(scale(3), real);
}

#[test]
fn guards_are_released_when_unwinding() {
    init_tracing();
    let _serial = SERIAL.lock();
    let real = scale(2);
    let before = entry(hooks_test_scale as *const ());

    let result = panic::catch_unwind(|| {
        let _hook = unsafe { install_hook!(hooks_test_scale, negate) };
        assert_eq!(scale(2), -2);
        suppress_hook!(hooks_test_scale);
        assert_eq!(hook_slot!(hooks_test_scale).status(), SlotStatus::Suppressed);
        panic!("leaving the scope early");
    });
    assert!(result.is_err());

    assert_eq!(hook_slot!(hooks_test_scale).status(), SlotStatus::Empty);
    assert_eq!(entry(hooks_test_scale as *const ()), before);
    assert_eq!(scale(2), real);
}

static READ_CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn failing_read(_fd: c_int, _buf: *mut c_void, _count: size_t) -> ssize_t {
    READ_CALLS.fetch_add(1, Ordering::Relaxed);
    -1
}

unsafe extern "C" fn suppressing_read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    suppress_hook!(read);
    READ_CALLS.fetch_add(1, Ordering::Relaxed);
    read(fd, buf, count)
}

/// Read end of a pipe holding `data`
fn pipe_with(data: &[u8]) -> c_int {
    let mut fds = [0; 2];
    unsafe {
        assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        assert_eq!(libc::write(fds[1], data.as_ptr().cast(), data.len()), data.len() as ssize_t);
        libc::close(fds[1]);
    }
    fds[0]
}

/// Reads up to 8 bytes from `fd` and closes it
fn read_all(fd: c_int) -> (ssize_t, Vec<u8>) {
    let mut buf = [0u8; 8];
    let n = unsafe { read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    unsafe { libc::close(fd) };
    (n, buf[..n.max(0) as usize].to_vec())
}

#[test]
fn read_can_be_hooked_and_restored() {
    init_tracing();
    let _serial = SERIAL.lock();
    let before = entry(read as *const ());
    READ_CALLS.store(0, Ordering::Relaxed);

    {
        let _hook = unsafe { install_hook!(read, failing_read) };
        assert_eq!(read_all(pipe_with(b"abc")).0, -1);
        assert_eq!(READ_CALLS.load(Ordering::Relaxed), 1);
    }

    assert_eq!(hook_slot!(read).status(), SlotStatus::Empty);
    assert_eq!(entry(read as *const ()), before);
    assert_eq!(read_all(pipe_with(b"abc")), (3, b"abc".to_vec()));
    assert_eq!(READ_CALLS.load(Ordering::Relaxed), 1);
}

#[test]
fn read_stub_can_suppress_itself() {
    init_tracing();
    let _serial = SERIAL.lock();
    let before = entry(read as *const ());
    READ_CALLS.store(0, Ordering::Relaxed);

    {
        let hook = unsafe { install_hook!(read, suppressing_read) };
        assert_eq!(read_all(pipe_with(b"abc")), (3, b"abc".to_vec()));
        assert_eq!(read_all(pipe_with(b"de")), (2, b"de".to_vec()));
        assert_eq!(READ_CALLS.load(Ordering::Relaxed), 2);
        assert_eq!(hook_slot!(read).status(), SlotStatus::Active);

        // replacing reuses what was recorded about `read` instead of querying it again
        unsafe { replace_hook!(hook, failing_read) };
        assert_eq!(read_all(pipe_with(b"abc")).0, -1);
        assert_eq!(READ_CALLS.load(Ordering::Relaxed), 3);
    }

    assert_eq!(hook_slot!(read).status(), SlotStatus::Empty);
    assert_eq!(entry(read as *const ()), before);
    assert_eq!(read_all(pipe_with(b"xyz")), (3, b"xyz".to_vec()));
}

#[test]
#[cfg(target_arch = "x86_64")]
fn failed_restore_keeps_the_slot_occupied() {
    static LOCKED: HookSlot = HookSlot::new("locked_page");
    init_tracing();
    let _serial = SERIAL.lock();

    unsafe {
        let len = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let page = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        assert_ne!(page, libc::MAP_FAILED);
        // a function of nops ending in ret
        ptr::write_bytes(page as *mut u8, 0x90, 32);
        *(page as *mut u8).add(32) = 0xc3;

        let hook = ScopedHookInstall::new(&LOCKED, page as *const (), negate as *const ()).unwrap();
        assert_eq!(LOCKED.status(), SlotStatus::Active);

        // a read-only shared file mapping can never be made writable
        let exe = File::open(std::env::current_exe().unwrap()).unwrap();
        let remapped = libc::mmap(
            page,
            len,
            libc::PROT_READ,
            libc::MAP_SHARED | libc::MAP_FIXED,
            exe.as_raw_fd(),
            0,
        );
        assert_eq!(remapped, page);

        let payload = panic::catch_unwind(AssertUnwindSafe(|| drop(hook))).unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert!(message.contains("cannot change memory protection"), "{message}");
        assert_eq!(LOCKED.status(), SlotStatus::Active);
    }
}

#[test]
fn nested_hooks_on_different_functions() {
    init_tracing();
    let _serial = SERIAL.lock();
    let (real_scale, real_offset) = (scale(1), offset(1));

    {
        let _outer = unsafe { install_hook!(hooks_test_scale, zero) };
        assert_eq!(scale(1), 0);
        {
            let _inner = unsafe { install_hook!(hooks_test_offset, negate) };
            assert_eq!(scale(1), 0);
            assert_eq!(offset(1), -1);

            let names: Vec<_> = active_hooks().into_iter().map(|hook| hook.name).collect();
            assert!(names.contains(&"hooks_test_scale"));
            assert!(names.contains(&"hooks_test_offset"));
        }
        assert_eq!(offset(1), real_offset);
        assert_eq!(scale(1), 0);

        {
            suppress_hook!(hooks_test_scale);
            assert_eq!(scale(1), real_scale);
            assert_eq!(hook_slot!(hooks_test_scale).status(), SlotStatus::Suppressed);
        }
        assert_eq!(scale(1), 0);
    }

    assert_eq!(scale(1), real_scale);
    assert!(active_hooks()
        .iter()
        .all(|hook| hook.name != "hooks_test_scale" && hook.name != "hooks_test_offset"));
}

#[test]
#[should_panic(expected = "already holds a patch")]
fn second_install_is_fatal() {
    let _serial = SERIAL.lock();
    let _first = unsafe { install_hook!(hooks_test_offset, negate) };
    let _second = unsafe { install_hook!(hooks_test_offset, square) };
}

#[test]
#[should_panic(expected = "has no active patch")]
fn suppressing_an_unhooked_function_is_fatal() {
    let _serial = SERIAL.lock();
    suppress_hook!(hooks_test_offset);
}

#[test]
#[cfg(target_arch = "x86_64")]
#[should_panic(expected = "cannot patch")]
fn function_too_small_for_trampoline_is_fatal() {
    let _serial = SERIAL.lock();
    let _hook = unsafe { install_hook!(hooks_test_empty, nothing) };
}
