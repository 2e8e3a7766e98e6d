use speculo::fd::EV_POLLED;
use speculo::time::{Tick, TICK_ETERNITY};
use speculo::{Backlog, Config, Direction, FdTab, IoCallback, IoEvents, Poller, SpecPoll};

use std::cell::RefCell;
use std::io::Write;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A tick that is always in the past, so the kernel wait never
/// blocks.
const EXPIRED: Tick = u32::MAX;

fn pair() -> (RawFd, UnixStream) {
    let (a, b) = UnixStream::pair().expect("socketpair failed");
    a.set_nonblocking(true).expect("nonblocking failed");
    (a.into_raw_fd(), b)
}

fn poller() -> SpecPoll {
    let mut p = SpecPoll::new();
    p.init(&Config::default()).expect("init failed");
    p
}

#[test]
fn polled_echo_round_trip() {
    let (a, mut peer) = pair();
    let mut tab = FdTab::new(1024);
    let mut p = poller();

    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    let echo: IoCallback = Rc::new(move |tab: &mut FdTab, fd: RawFd| {
        l.borrow_mut().push(fd);

        let mut buf = [0u8; 256];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            unsafe { libc::write(fd, buf.as_ptr().cast(), n as usize) };
        }

        tab.set_polled(fd, Direction::Read);
    });

    tab.insert(a, Some(echo));
    tab.set_polled(a, Direction::Read);
    p.poll(&mut tab, EXPIRED, Backlog::default());
    assert!(log.borrow().is_empty(), "no data yet, no dispatch");

    peer.write_all(b"ping").expect("peer write failed");

    let waits = p.stats().wait_calls;
    p.poll(&mut tab, TICK_ETERNITY, Backlog::default());

    assert_eq!(*log.borrow(), vec![a]);
    assert_eq!(p.stats().wait_calls, waits + 1);
    assert_eq!(tab.state(a).status(Direction::Read), EV_POLLED);
    assert_eq!(tab.nb_spec(), 0);

    tab.delete(a);
}

#[test]
fn polled_fd_is_invoked_once_per_tick() {
    let (a, mut peer) = pair();
    let mut tab = FdTab::new(1024);
    let mut p = poller();

    // never consumes and never demotes: readiness persists
    let count = Rc::new(RefCell::new(0u32));
    let c = count.clone();
    let cb: IoCallback = Rc::new(move |_tab: &mut FdTab, _fd: RawFd| {
        *c.borrow_mut() += 1;
    });

    tab.insert(a, Some(cb));
    tab.set_polled(a, Direction::Read);
    peer.write_all(b"x").expect("peer write failed");

    p.poll(&mut tab, EXPIRED, Backlog::default());
    assert_eq!(*count.borrow(), 1);

    p.poll(&mut tab, EXPIRED, Backlog::default());
    assert_eq!(*count.borrow(), 2);

    tab.delete(a);
}

#[test]
fn stalled_writer_is_handed_back_to_the_kernel() {
    let (a, _peer) = pair();
    let mut tab = FdTab::new(1024);
    let mut p = poller();

    let count = Rc::new(RefCell::new(0u32));
    let c = count.clone();
    let cb: IoCallback = Rc::new(move |tab: &mut FdTab, fd: RawFd| {
        *c.borrow_mut() += 1;
        // pretend the write returned EAGAIN
        tab.set_polled(fd, Direction::Write);
    });

    tab.insert(a, Some(cb));
    tab.set_active(a, Direction::Write);

    // tick 1: driven speculatively, stalls
    p.poll(&mut tab, EXPIRED, Backlog::default());
    assert_eq!(*count.borrow(), 1);
    assert_eq!(p.stats().ctl_add, 0);

    // tick 2: the drain registers the fd with the kernel
    p.poll(&mut tab, EXPIRED, Backlog::default());
    assert_eq!(p.stats().ctl_add, 1);
    assert_eq!(tab.nb_spec(), 0);

    // the socket is writable, so the kernel path now drives it
    assert_eq!(*count.borrow(), 2);

    tab.delete(a);
}

#[test]
fn event_on_concurrently_closed_fd_is_skipped() {
    let (a, mut peer_a) = pair();
    let (b, mut peer_b) = pair();
    let mut tab = FdTab::new(1024);
    let mut p = poller();

    // each callback closes the other fd: whichever event the
    // kernel reports first leaves the second one orphaned
    let log = Rc::new(RefCell::new(Vec::new()));

    let l = log.clone();
    let kill_b: IoCallback = Rc::new(move |tab: &mut FdTab, fd: RawFd| {
        l.borrow_mut().push(fd);
        if tab.is_owned(b) {
            tab.delete(b);
        }
    });
    let l = log.clone();
    let kill_a: IoCallback = Rc::new(move |tab: &mut FdTab, fd: RawFd| {
        l.borrow_mut().push(fd);
        if tab.is_owned(a) {
            tab.delete(a);
        }
    });

    tab.insert(a, Some(kill_b));
    tab.insert(b, Some(kill_a));
    tab.set_polled(a, Direction::Read);
    tab.set_polled(b, Direction::Read);
    p.poll(&mut tab, EXPIRED, Backlog::default());

    peer_a.write_all(b"x").expect("peer write failed");
    peer_b.write_all(b"x").expect("peer write failed");
    p.poll(&mut tab, EXPIRED, Backlog::default());

    assert_eq!(log.borrow().len(), 1, "second event must be skipped");

    let survivor = log.borrow()[0];
    assert!(tab.is_owned(survivor));
    tab.delete(survivor);
}

#[test]
fn spec_list_swap_removal_keeps_every_entry_visited() {
    let (x, _px) = pair();
    let (y, _py) = pair();
    let (z, _pz) = pair();
    let mut tab = FdTab::new(1024);
    let mut p = poller();

    let log = Rc::new(RefCell::new(Vec::new()));

    let l = log.clone();
    let close_self: IoCallback = Rc::new(move |tab: &mut FdTab, fd: RawFd| {
        l.borrow_mut().push(fd);
        tab.delete(fd);
    });
    let l = log.clone();
    let record: IoCallback = Rc::new(move |_tab: &mut FdTab, fd: RawFd| {
        l.borrow_mut().push(fd);
    });

    tab.insert(x, Some(close_self));
    tab.insert(y, Some(record.clone()));
    tab.insert(z, Some(record));

    // enqueue order fixes the spec-list order to [x, y, z]
    tab.set_active(x, Direction::Read);
    tab.set_active(y, Direction::Read);
    tab.set_active(z, Direction::Read);

    p.poll(&mut tab, EXPIRED, Backlog::default());

    // x removes itself, z is swapped into its slot and must be
    // re-examined before the iteration moves on to y
    assert_eq!(*log.borrow(), vec![x, z, y]);
    assert_eq!(tab.nb_spec(), 2);

    tab.delete(y);
    tab.delete(z);
}

#[test]
fn nonempty_spec_list_keeps_the_wait_at_zero() {
    let (a, _peer) = pair();
    let mut tab = FdTab::new(1024);
    let mut p = poller();

    tab.insert(a, None);
    tab.set_active(a, Direction::Read);
    p.poll(&mut tab, EXPIRED, Backlog::default());
    assert!(tab.in_spec_list(a));

    // a deadline-free tick would block for MAX_DELAY_MS if the
    // spec list were ignored
    let start = Instant::now();
    p.poll(&mut tab, TICK_ETERNITY, Backlog::default());
    assert!(start.elapsed() < Duration::from_secs(5));

    tab.delete(a);
}

#[test]
fn pending_backlog_keeps_the_wait_at_zero() {
    let (a, _peer) = pair();
    let mut tab = FdTab::new(1024);
    let mut p = poller();

    tab.insert(a, None);
    tab.set_polled(a, Direction::Read);
    p.poll(&mut tab, EXPIRED, Backlog::default());

    let backlog = Backlog {
        run_queue: true,
        signal_queue: false,
    };

    let start = Instant::now();
    p.poll(&mut tab, TICK_ETERNITY, backlog);
    assert!(start.elapsed() < Duration::from_secs(5));

    tab.delete(a);
}

#[test]
fn sticky_bits_survive_the_tick_reset() {
    let (a, _peer) = pair();
    let mut tab = FdTab::new(1024);
    let mut p = poller();

    let seen = Rc::new(RefCell::new(IoEvents::empty()));
    let s = seen.clone();
    let cb: IoCallback = Rc::new(move |tab: &mut FdTab, fd: RawFd| {
        *s.borrow_mut() = tab.ev(fd);
        tab.clear(fd, Direction::Read);
    });

    tab.insert(a, Some(cb));
    tab.set_active(a, Direction::Read);
    // a deferred error pinned on by external code
    tab.add_ev(a, IoEvents::ERR);

    p.poll(&mut tab, EXPIRED, Backlog::default());
    p.poll(&mut tab, EXPIRED, Backlog::default());

    assert_eq!(*seen.borrow(), IoEvents::IN | IoEvents::ERR);

    tab.delete(a);
}

#[test]
fn deadline_bounds_the_wait() {
    let (a, _peer) = pair();
    let mut tab = FdTab::new(1024);
    let mut p = poller();

    tab.insert(a, None);
    tab.set_polled(a, Direction::Read);
    p.poll(&mut tab, EXPIRED, Backlog::default());

    let exp = p.now_ms().wrapping_add(50);
    let start = Instant::now();
    p.poll(&mut tab, exp, Backlog::default());

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(30), "returned too early");
    assert!(elapsed < Duration::from_secs(5), "missed the deadline");

    tab.delete(a);
}
