use std::pin::Pin;
use std::sync::Mutex;

use quickcheck_macros::quickcheck;

use super::clock::TimestampNode;
use super::klock::lock_cpu;
use super::thread::{self, wait_node_accessor, ThreadAttr, ThreadCb};
use super::wait::abort_wait;
use super::*;

static TEST_ATTR: ThreadAttr = ThreadAttr { name: "test" };

/// Define a self-contained mock system type. Expanded inside each test
/// function, so every test gets its own kernel state and CPU Lock flag and
/// tests can run in parallel.
macro_rules! define_system {
    ($name:ident) => {
        define_system!($name, &[]);
    };
    ($name:ident, $pool:expr) => {
        struct $name;

        static CPU_LOCK: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        static TICK_COUNT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        static KERNEL_STATE: State<$name> = State::new();

        unsafe impl PortThreading for $name {
            fn try_enter_cpu_lock() -> bool {
                !CPU_LOCK.swap(true, std::sync::atomic::Ordering::Relaxed)
            }
            unsafe fn leave_cpu_lock() {
                CPU_LOCK.store(false, std::sync::atomic::Ordering::Relaxed);
            }
            fn is_cpu_lock_active() -> bool {
                CPU_LOCK.load(std::sync::atomic::Ordering::Relaxed)
            }
            unsafe fn yield_cpu() {}
        }

        unsafe impl PortTimer for $name {
            unsafe fn tick_count() -> Ticks {
                TICK_COUNT.load(std::sync::atomic::Ordering::Relaxed)
            }
        }

        impl KernelCfg for $name {
            fn state() -> &'static State<$name> {
                &KERNEL_STATE
            }
            fn timer_cb_pool() -> &'static [TimerCb<$name>] {
                $pool
            }
        }
    };
}

fn leak_thread<Traits: KernelTraits>(priority: ThreadPriority) -> &'static ThreadCb<Traits> {
    Box::leak(Box::new(ThreadCb::new(&TEST_ATTR, priority)))
}

/// Collect the wait queue's contents, head to tail.
fn wait_queue_contents<Traits: KernelTraits>(
    queue: &WaitQueue<Traits>,
) -> Vec<&'static ThreadCb<Traits>> {
    let mut lock = lock_cpu::<Traits>().unwrap();
    let accessor = wait_node_accessor!(&queue.waits, lock.borrow_mut());
    accessor.iter().map(|(ident, _)| ident.0).collect()
}

#[test]
fn priority_insertion_order() {
    define_system!(System);

    // Waiters with priorities [5, 9, 5, 7, 9, 1] must come out as
    // [9, 9, 7, 5, 5, 1], and within each band the older arrival first.
    let prios = [5u8, 9, 5, 7, 9, 1];
    let threads: Vec<_> = prios
        .iter()
        .map(|&p| leak_thread::<System>(p))
        .collect();

    let queue = WaitQueue::new();
    {
        let mut lock = lock_cpu::<System>().unwrap();
        for &cb in &threads {
            queue.link(lock.borrow_mut(), cb);
        }
    }

    let contents = wait_queue_contents(&queue);
    let head_to_tail: Vec<_> = contents.iter().map(|cb| cb.priority).collect();
    assert_eq!(head_to_tail, [9, 9, 7, 5, 5, 1]);

    // The first-linked 9 precedes the second-linked 9; same for the 5s.
    assert!(std::ptr::eq(contents[0], threads[1]));
    assert!(std::ptr::eq(contents[1], threads[4]));
    assert!(std::ptr::eq(contents[3], threads[0]));
    assert!(std::ptr::eq(contents[4], threads[2]));

    let mut lock = lock_cpu::<System>().unwrap();
    for &cb in &threads {
        abort_wait(lock.borrow_mut(), cb);
    }
}

#[quickcheck]
fn qc_wait_queue_priority_order(prios: Vec<u8>) {
    define_system!(System);

    let threads: Vec<_> = prios
        .iter()
        .map(|&p| leak_thread::<System>(p))
        .collect();

    let queue = WaitQueue::new();
    {
        let mut lock = lock_cpu::<System>().unwrap();
        for &cb in &threads {
            queue.link(lock.borrow_mut(), cb);
        }
    }

    // A stable sort by descending priority is exactly "priority order,
    // FIFO within a band".
    let mut expected = threads.clone();
    expected.sort_by_key(|cb| core::cmp::Reverse(cb.priority));

    let contents = wait_queue_contents(&queue);
    assert_eq!(contents.len(), expected.len());
    for (got, want) in contents.iter().zip(&expected) {
        assert!(std::ptr::eq(*got, *want));
    }

    let mut lock = lock_cpu::<System>().unwrap();
    for &cb in &threads {
        abort_wait(lock.borrow_mut(), cb);
    }
}

#[test]
fn ready_dispatch() {
    define_system!(System);

    // A(3), B(7), C(7), D(5): successive dispatches must return B, C, D, A.
    let a = leak_thread::<System>(3);
    let b = leak_thread::<System>(7);
    let c = leak_thread::<System>(7);
    let d = leak_thread::<System>(5);

    let mut lock = lock_cpu::<System>().unwrap();
    let state = System::state();
    for &cb in &[a, b, c, d] {
        state.ready.link(lock.borrow_mut(), cb);
        assert_eq!(cb.st.get(&*lock), ThreadSt::Ready);
    }

    for &expected in &[b, c, d, a] {
        let got = state.ready.unlink_head(lock.borrow_mut());
        assert!(std::ptr::eq(got, expected));
        assert_eq!(got.st.get(&*lock), ThreadSt::Running);
    }
    assert!(state.ready.is_empty(lock.borrow_mut()));
}

#[test]
fn choose_running_thread_preempts() {
    define_system!(System);

    let low = leak_thread::<System>(3);
    let high = leak_thread::<System>(7);

    {
        let mut lock = lock_cpu::<System>().unwrap();
        System::state().ready.link(lock.borrow_mut(), low);
    }
    System::choose_running_thread();
    {
        let lock = lock_cpu::<System>().unwrap();
        let running = System::state().running_thread.get(&*lock).unwrap();
        assert!(std::ptr::eq(running, low));
    }

    // A higher-priority arrival takes over; the preempted thread goes back
    // to the ready queue.
    {
        let mut lock = lock_cpu::<System>().unwrap();
        System::state().ready.link(lock.borrow_mut(), high);
    }
    System::choose_running_thread();
    {
        let mut lock = lock_cpu::<System>().unwrap();
        let running = System::state().running_thread.get(&*lock).unwrap();
        assert!(std::ptr::eq(running, high));
        assert_eq!(low.st.get(&*lock), ThreadSt::Ready);
        assert_eq!(System::state().ready.front_priority(lock.borrow_mut()), Some(3));
    }
}

#[test]
fn timeouts_fire_in_order() {
    define_system!(System, &TIMER_POOL);

    static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    fn record(i: usize) {
        FIRED.lock().unwrap().push(i);
    }

    static ATTRS: [TimerAttr; 4] = [
        TimerAttr { entry_point: record, entry_param: 0, name: "t0" },
        TimerAttr { entry_point: record, entry_param: 1, name: "t1" },
        TimerAttr { entry_point: record, entry_param: 2, name: "t2" },
        TimerAttr { entry_point: record, entry_param: 3, name: "t3" },
    ];
    static TIMER_POOL: [TimerCb<System>; 4] = [
        TimerCb::new(0, &ATTRS[0]),
        TimerCb::new(1, &ATTRS[1]),
        TimerCb::new(2, &ATTRS[2]),
        TimerCb::new(3, &ATTRS[3]),
    ];

    // Enqueue expirations at [100, 50, 75, 50], in that order.
    TIMER_POOL[0].start(100).unwrap();
    TIMER_POOL[1].start(50).unwrap();
    TIMER_POOL[2].start(75).unwrap();
    TIMER_POOL[3].start(50).unwrap();

    // At t=60 exactly the nodes at 50 fire, in insertion order.
    TICK_COUNT.store(60, std::sync::atomic::Ordering::Relaxed);
    System::timer_tick();
    assert_eq!(*FIRED.lock().unwrap(), [1, 3]);

    // At t=200 the remaining two fire, 75 before 100.
    TICK_COUNT.store(200, std::sync::atomic::Ordering::Relaxed);
    System::timer_tick();
    assert_eq!(*FIRED.lock().unwrap(), [1, 3, 2, 0]);

    // One-shot timers are inactive afterwards.
    for timer in &TIMER_POOL {
        assert!(!timer.is_active().unwrap());
    }
}

#[test]
fn periodic_timer_reenqueues() {
    define_system!(System, &TIMER_POOL);

    static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    fn record(i: usize) {
        FIRED.lock().unwrap().push(i);
    }

    static ATTR: TimerAttr = TimerAttr {
        entry_point: record,
        entry_param: 0,
        name: "periodic",
    };
    static TIMER_POOL: [TimerCb<System>; 1] = [TimerCb::new(0, &ATTR)];

    // First expiration at t=100, period 50.
    TIMER_POOL[0].set_period(Some(50)).unwrap();
    TIMER_POOL[0].start(100).unwrap();

    // One call at t=250 fires the timer at t=100, 150, 200 and 250; the
    // node is then parked at t=300.
    TICK_COUNT.store(250, std::sync::atomic::Ordering::Relaxed);
    System::timer_tick();
    assert_eq!(FIRED.lock().unwrap().len(), 4);
    assert!(TIMER_POOL[0].is_active().unwrap());

    TICK_COUNT.store(299, std::sync::atomic::Ordering::Relaxed);
    System::timer_tick();
    assert_eq!(FIRED.lock().unwrap().len(), 4);

    TICK_COUNT.store(300, std::sync::atomic::Ordering::Relaxed);
    System::timer_tick();
    assert_eq!(FIRED.lock().unwrap().len(), 5);
}

#[quickcheck]
fn qc_timestamp_queue_order(stamps: Vec<u64>) {
    define_system!(System);

    let owner = leak_thread::<System>(0);
    let queue: TimestampQueue<System> = crate::utils::Init::INIT;

    let nodes: Vec<&'static TimestampNode<System>> = stamps
        .iter()
        .map(|&ts| &*Box::leak(Box::new(TimestampNode::new_wake(ts, owner))))
        .collect();

    {
        let mut lock = lock_cpu::<System>().unwrap();
        for &node in &nodes {
            // Safety: the node is never moved or dropped (it's leaked)
            queue.link(lock.borrow_mut(), unsafe { Pin::new_unchecked(node) });
        }
    }

    // A stable sort by timestamp is exactly "chronological order, FIFO
    // among equal stamps".
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by_key(|&i| stamps[i]);

    // Verify by repeatedly checking the head and unlinking it.
    let mut lock = lock_cpu::<System>().unwrap();
    for &i in &order {
        let head = queue.front(lock.borrow_mut()).unwrap();
        assert!(std::ptr::eq(head.0.as_ptr(), nodes[i]));
        assert!(queue.unlink(lock.borrow_mut(), nodes[i]));
    }
    assert!(queue.is_empty(lock.borrow_mut()));
}

#[test]
fn destroyed_thread_resume_is_noop() {
    define_system!(System);

    let victim = leak_thread::<System>(5);
    let queue = WaitQueue::new();

    {
        let mut lock = lock_cpu::<System>().unwrap();
        queue.link(lock.borrow_mut(), victim);
        victim.st.replace(&mut *lock, ThreadSt::Waiting);
    }

    // The thread is torn down externally while it's still enqueued.
    victim.mark_destroyed().unwrap();

    // `resume_one` unlinks the node but skips the resume.
    assert!(queue.resume_one());
    assert!(queue.is_empty());
    {
        let mut lock = lock_cpu::<System>().unwrap();
        assert!(System::state().ready.is_empty(lock.borrow_mut()));
        assert_eq!(victim.st.get(&*lock), ThreadSt::Destroyed);
    }
}

#[test]
fn resume_all_drains_in_priority_order() {
    define_system!(System);

    let threads: Vec<_> = [2u8, 8, 4, 8, 1]
        .iter()
        .map(|&p| leak_thread::<System>(p))
        .collect();

    let queue = WaitQueue::new();
    {
        let mut lock = lock_cpu::<System>().unwrap();
        for &cb in &threads {
            queue.link(lock.borrow_mut(), cb);
            cb.st.replace(&mut *lock, ThreadSt::Waiting);
        }
    }

    queue.resume_all();
    assert!(queue.is_empty());

    // Every thread went through the admission path and is Ready now.
    let mut lock = lock_cpu::<System>().unwrap();
    let mut count = 0;
    while !System::state().ready.is_empty(lock.borrow_mut()) {
        System::state().ready.unlink_head(lock.borrow_mut());
        count += 1;
    }
    assert_eq!(count, threads.len());
}

#[test]
fn resume_all_on_empty_queue_is_noop() {
    define_system!(System);

    let queue: WaitQueue<System> = WaitQueue::new();
    queue.resume_all();
    assert!(queue.is_empty());
}

#[test]
fn static_init_first_link() {
    define_system!(System);

    // `KERNEL_STATE` is a zero-initialized static; registering a thread is
    // the first operation ever performed on the top-level list.
    let first = leak_thread::<System>(4);
    thread::register_thread(first, None).unwrap();

    let mut seen = Vec::new();
    thread::for_each_top_thread::<System>(|cb| seen.push(cb as *const _ as usize)).unwrap();
    assert_eq!(seen, [first as *const _ as usize]);

    // Children hang off their parent, in registration order.
    let child_a = leak_thread::<System>(1);
    let child_b = leak_thread::<System>(2);
    thread::register_thread(child_a, Some(first)).unwrap();
    thread::register_thread(child_b, Some(first)).unwrap();

    let mut children = Vec::new();
    first
        .for_each_child(|cb| children.push(cb as *const _ as usize))
        .unwrap();
    assert_eq!(
        children,
        [child_a as *const _ as usize, child_b as *const _ as usize]
    );
}

#[test]
fn terminated_list_is_fifo() {
    define_system!(System);

    let first = leak_thread::<System>(9);
    let second = leak_thread::<System>(1);

    first.terminate().unwrap();
    second.terminate().unwrap();

    assert_eq!(first.sched_state().unwrap(), ThreadSt::Terminated);

    // Reclamation order is arrival order, not priority order.
    let got = thread::reclaim_one::<System>().unwrap().unwrap();
    assert!(std::ptr::eq(got, first));
    let got = thread::reclaim_one::<System>().unwrap().unwrap();
    assert!(std::ptr::eq(got, second));
    assert!(thread::reclaim_one::<System>().unwrap().is_none());
}

#[test]
fn timeout_fires_before_resume() {
    define_system!(System);

    let sleeper = leak_thread::<System>(6);
    let queue = WaitQueue::new();

    let node = TimestampNode::new_wake(100, sleeper);
    // Safety: `node` is unlinked by the expiration below, before it's
    // dropped.
    let node_pin = unsafe { Pin::new_unchecked(&node) };

    {
        let mut lock = lock_cpu::<System>().unwrap();
        queue.link(lock.borrow_mut(), sleeper);
        sleeper.st.replace(&mut *lock, ThreadSt::Waiting);
        System::state().clock.link(lock.borrow_mut(), node_pin);
    }

    // The deadline passes first: the expiration must unlink its own node
    // *and* detach the stale wait-queue entry before the thread can run.
    System::state().clock.check_timestamp(100);

    assert!(queue.is_empty());
    {
        let mut lock = lock_cpu::<System>().unwrap();
        assert_eq!(sleeper.st.get(&*lock), ThreadSt::Ready);
        assert_eq!(
            sleeper.wait.wait_result.get(&*lock),
            Err(WaitError::Timeout)
        );
        assert!(!node.is_linked(lock.borrow_mut()));
    }
}

#[test]
fn resume_fires_before_timeout() {
    define_system!(System);

    let sleeper = leak_thread::<System>(6);
    let queue = WaitQueue::new();

    let node = TimestampNode::new_wake(100, sleeper);
    // Safety: `node` is unlinked below, before it's dropped.
    let node_pin = unsafe { Pin::new_unchecked(&node) };

    {
        let mut lock = lock_cpu::<System>().unwrap();
        queue.link(lock.borrow_mut(), sleeper);
        sleeper.st.replace(&mut *lock, ThreadSt::Waiting);
        System::state().clock.link(lock.borrow_mut(), node_pin);
    }

    // The queue side wins; the waking path then disarms the timeout, the
    // way `wait_until` does.
    assert!(queue.resume_one());
    {
        let mut lock = lock_cpu::<System>().unwrap();
        assert_eq!(sleeper.st.get(&*lock), ThreadSt::Ready);
        assert_eq!(sleeper.wait.wait_result.get(&*lock), Ok(()));
        assert!(System::state().clock.unlink(lock.borrow_mut(), &node));
        // A second unlink is a no-op.
        assert!(!System::state().clock.unlink(lock.borrow_mut(), &node));
    }

    // A later tick finds nothing to fire.
    System::state().clock.check_timestamp(1000);
}
