//! End-to-end tests for the deferred dispatcher under a simulated driver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tactus_concurrency::{
    DeferredQueue, GameThreadDispatcher, Job, OpResult, SingleThreadPool, ThreadPriority,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Stand-in for the host's game thread: one worker draining queued jobs.
struct TestGameThread {
    sender: crossbeam::channel::Sender<Job>,
    id: thread::ThreadId,
}

impl TestGameThread {
    fn start() -> Arc<Self> {
        let (sender, receiver) = crossbeam::channel::unbounded::<Job>();
        let (id_tx, id_rx) = crossbeam::channel::bounded(1);
        thread::spawn(move || {
            let _ = id_tx.send(thread::current().id());
            for job in receiver {
                job();
            }
        });
        Arc::new(Self {
            sender,
            id: id_rx.recv().unwrap(),
        })
    }
}

impl GameThreadDispatcher for TestGameThread {
    fn dispatch(&self, job: Job) {
        let _ = self.sender.send(job);
    }

    fn is_game_thread(&self) -> bool {
        thread::current().id() == self.id
    }
}

fn dispatcher(name: &'static str) -> (Arc<DeferredQueue<u64>>, Arc<TestGameThread>) {
    let game = TestGameThread::start();
    let pool = Arc::new(SingleThreadPool::new(name, ThreadPriority::Normal));
    (
        Arc::new(DeferredQueue::with_pool(name, pool, game.clone())),
        game,
    )
}

#[test]
fn async_deferrals_from_many_threads_all_execute() {
    init_logging();
    let (queue, _game) = dispatcher("deferred-async-stress");
    let executed = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let executed = executed.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    let executed = executed.clone();
                    queue.defer_async(move || {
                        executed.fetch_add(1, Ordering::SeqCst);
                        OpResult::Done
                    });
                }
            })
        })
        .collect();

    // Driver ticking concurrently with the producers.
    for tick in 0..50u64 {
        queue.run(&tick);
        thread::sleep(Duration::from_micros(200));
    }
    for producer in producers {
        producer.join().unwrap();
    }
    queue.wait();

    assert_eq!(executed.load(Ordering::SeqCst), 4 * 250);
}

#[test]
fn game_drains_never_overlap() {
    let (queue, _game) = dispatcher("deferred-game-stress");
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let executed = Arc::new(AtomicUsize::new(0));

    for _ in 0..200 {
        let active = active.clone();
        let max_active = max_active.clone();
        let executed = executed.clone();
        queue.defer_game(move || {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            active.fetch_sub(1, Ordering::SeqCst);
            executed.fetch_add(1, Ordering::SeqCst);
            OpResult::Done
        });
    }

    // Several ticks in quick succession request the same drain; the
    // reentrant counter coalesces them into one loop on the game thread.
    for tick in 0..10u64 {
        queue.run(&tick);
    }
    queue.wait();

    assert_eq!(executed.load(Ordering::SeqCst), 200);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

#[test]
fn sync_deferrals_run_on_the_driver_with_context() {
    let (queue, _game) = dispatcher("deferred-sync-stress");
    let contexts = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            let contexts = contexts.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    let contexts = contexts.clone();
                    queue.defer_sync(move |ctx| {
                        contexts.lock().push(ctx.copied());
                        OpResult::Done
                    });
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut tick = 0u64;
    while !queue.is_empty() {
        queue.run(&tick);
        tick += 1;
    }

    let contexts = contexts.lock();
    assert_eq!(contexts.len(), 4 * 25);
    // Every sync op ran inside a tick and saw that tick's context.
    assert!(contexts.iter().all(|ctx| ctx.is_some()));
}

#[test]
fn keep_running_op_executes_once_per_drain() {
    let (queue, _game) = dispatcher("deferred-keeprunning");
    let steps = Arc::new(AtomicUsize::new(0));

    let counter = steps.clone();
    queue.defer_game(move || {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 < 5 {
            OpResult::KeepRunning
        } else {
            OpResult::Done
        }
    });

    queue.wait();

    // wait() keeps draining until the op finally reports Done.
    assert_eq!(steps.load(Ordering::SeqCst), 5);
    assert!(queue.is_empty());
}

#[test]
fn wait_drains_all_three_channels() {
    let (queue, _game) = dispatcher("deferred-wait-all");
    let executed = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let a = executed.clone();
        queue.defer_async(move || {
            a.fetch_add(1, Ordering::SeqCst);
            OpResult::Done
        });
        let g = executed.clone();
        queue.defer_game(move || {
            g.fetch_add(1, Ordering::SeqCst);
            OpResult::Done
        });
        let s = executed.clone();
        queue.defer_sync(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            OpResult::Done
        });
    }

    queue.wait();

    assert_eq!(executed.load(Ordering::SeqCst), 30);
    assert!(queue.is_empty());
}
