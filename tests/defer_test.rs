#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use oath::{defer, Deferred, Error, Status};
    use std::sync::{Arc, Mutex};
    use std::{thread, time::Duration};

    fn init_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .is_test(true)
            .try_init();
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, tag: &'static str) -> impl FnOnce(i32) + Send + 'static {
        let log = log.clone();
        move |v| log.lock().unwrap().push(format!("{tag}({v})"))
    }

    fn record_err(log: &Log, tag: &'static str) -> impl FnOnce(String) + Send + 'static {
        let log = log.clone();
        move |e| log.lock().unwrap().push(format!("{tag}({e})"))
    }

    #[test]
    fn test_single_transition() {
        init_logger();
        let log = Log::default();
        let deferred = defer::<i32, String>();
        deferred.promise().then(record(&log, "ok"), record_err(&log, "err"));
        deferred.resolve(1);
        deferred.reject("late".into());
        deferred.resolve(2);
        assert_eq!(deferred.status(), Status::Fulfilled);
        assert_eq!(deferred.promise().value(), Some(Ok(1)));
        assert_eq!(*log.lock().unwrap(), vec!["ok(1)"]);
    }

    #[test]
    fn test_fulfilled_then_runs_before_returning() {
        let log = Log::default();
        let deferred = defer::<i32, String>();
        deferred.resolve(7);
        deferred.promise().then(record(&log, "ok"), record_err(&log, "err"));
        assert_eq!(*log.lock().unwrap(), vec!["ok(7)"]);
    }

    #[test]
    fn test_pending_continuations_run_in_order() {
        let log = Log::default();
        let deferred = defer::<i32, String>();
        deferred
            .promise()
            .on_success(record(&log, "c1"))
            .on_success(record(&log, "c2"))
            .on_success(record(&log, "c3"));
        assert!(log.lock().unwrap().is_empty());
        deferred.resolve(5);
        assert_eq!(*log.lock().unwrap(), vec!["c1(5)", "c2(5)", "c3(5)"]);
    }

    #[test]
    fn test_reject_drains_every_failure_continuation() {
        let log = Log::default();
        let deferred = defer::<i32, String>();
        let promise = deferred.promise();
        promise.catch(record_err(&log, "f1"));
        promise.catch(record_err(&log, "f2"));
        deferred.reject("E".into());
        assert_eq!(*log.lock().unwrap(), vec!["f1(E)", "f2(E)"]);
        assert_eq!(promise.status(), Status::Rejected);
    }

    #[test]
    fn test_late_registrations_do_not_interleave() {
        let log = Log::default();
        let deferred = defer::<i32, String>();
        let promise = deferred.promise();
        promise.on_success(record(&log, "before"));
        deferred.resolve(3);
        promise.on_success(record(&log, "after1"));
        promise.on_success(record(&log, "after2"));
        assert_eq!(*log.lock().unwrap(), vec!["before(3)", "after1(3)", "after2(3)"]);
    }

    #[test]
    fn test_flattening_resolves_with_inner_value() {
        init_logger();
        let log = Log::default();
        let outer = defer::<i32, String>();
        let inner = defer::<i32, String>();
        let promise = outer.promise();
        let chained = inner.promise();
        let first = log.clone();
        promise.on_success(move |v| {
            first.lock().unwrap().push(format!("first({v})"));
            chained
        });
        promise.on_success(record(&log, "second"));

        outer.resolve(1);
        assert_eq!(promise.status(), Status::Pending);
        assert_eq!(*log.lock().unwrap(), vec!["first(1)"]);

        inner.resolve(42);
        assert_eq!(promise.value(), Some(Ok(42)));
        assert_eq!(*log.lock().unwrap(), vec!["first(1)", "second(42)"]);
    }

    #[test]
    fn test_flattening_forwards_inner_rejection() {
        let log = Log::default();
        let outer = defer::<i32, String>();
        let inner = defer::<i32, String>();
        let chained = inner.promise();
        outer.promise().on_success(move |_| chained).catch(record_err(&log, "caught"));
        outer.resolve(1);
        inner.reject("X".into());
        assert_eq!(outer.status(), Status::Rejected);
        assert_eq!(outer.promise().value(), Some(Err("X".to_string())));
        assert_eq!(*log.lock().unwrap(), vec!["caught(X)"]);
    }

    #[test]
    fn test_flattening_with_already_settled_inner() {
        let log = Log::default();
        let outer = defer::<i32, String>();
        let inner = defer::<i32, String>();
        inner.resolve(10);
        let chained = inner.promise();
        outer.promise().on_success(move |_| chained).on_success(record(&log, "next"));
        outer.resolve(1);
        assert_eq!(*log.lock().unwrap(), vec!["next(10)"]);
        assert_eq!(outer.promise().value(), Some(Ok(10)));
    }

    #[test]
    fn test_registration_while_chained_waits_for_inner() {
        let log = Log::default();
        let outer = defer::<i32, String>();
        let inner = defer::<i32, String>();
        let chained = inner.promise();
        outer.promise().on_success(move |_| chained);
        outer.resolve(1);
        outer.promise().on_success(record(&log, "late"));
        assert!(log.lock().unwrap().is_empty());
        inner.resolve(2);
        assert_eq!(*log.lock().unwrap(), vec!["late(2)"]);
    }

    #[test]
    fn test_no_consumers_no_error() {
        let deferred = defer::<i32, String>();
        deferred.resolve(1);
        let deferred = defer::<i32, String>();
        deferred.reject("dropped".into());
        assert_eq!(deferred.status(), Status::Rejected);
    }

    #[test]
    fn test_scenario_double_on_resolve() {
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        let s = defer::<i32, String>();
        s.promise().on_success(move |v| *slot.lock().unwrap() = Some(v * 2));
        s.resolve(5);
        assert_eq!(*seen.lock().unwrap(), Some(10));
    }

    #[test]
    fn test_scenario_catch_records_error() {
        let recorded = Arc::new(Mutex::new(String::new()));
        let slot = recorded.clone();
        let s = defer::<i32, String>();
        s.promise().catch(move |e| *slot.lock().unwrap() = e);
        s.reject("boom".into());
        assert_eq!(*recorded.lock().unwrap(), "boom");
    }

    #[test]
    fn test_scenario_then_after_resolve() {
        let recorded = Arc::new(Mutex::new(0));
        let slot = recorded.clone();
        let s = defer::<i32, String>();
        s.resolve(1);
        s.promise().on_success(move |v| *slot.lock().unwrap() = v);
        assert_eq!(*recorded.lock().unwrap(), 1);
    }

    #[test]
    fn test_await_across_threads() {
        let deferred = defer::<i32, String>();
        let promise = deferred.promise();
        let waiter = thread::spawn(move || block_on(promise));
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            deferred.resolve(42);
        })
        .join()
        .expect("The producer thread has panicked");
        assert_eq!(waiter.join().expect("The waiter thread has panicked"), Ok(42));
    }

    #[test]
    fn test_await_many_consumers() {
        let deferred = defer::<String, String>();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let promise = deferred.promise();
                thread::spawn(move || block_on(promise))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        deferred.resolve("🍓".into());
        for waiter in waiters {
            assert_eq!(waiter.join().expect("A waiter thread has panicked"), Ok("🍓".to_string()));
        }
    }

    #[test]
    fn test_await_rejection() {
        let deferred = defer::<i32, String>();
        deferred.reject("💥".into());
        let result = block_on(deferred.promise());
        assert_eq!(result, Err(Error::Rejected("💥".to_string())));
        assert_eq!(result.unwrap_err().into_rejection(), Some("💥".to_string()));
    }

    #[test]
    fn test_await_abandoned() {
        let deferred = Deferred::<i32, String>::new();
        let promise = deferred.promise();
        let waiter = thread::spawn(move || block_on(promise));
        thread::sleep(Duration::from_millis(20));
        std::mem::drop(deferred);
        assert_eq!(waiter.join().expect("The waiter thread has panicked"), Err(Error::Abandoned));
    }

    #[test]
    fn test_await_chained_abandoned() {
        let outer = defer::<i32, String>();
        let inner = defer::<i32, String>();
        let chained = inner.promise();
        outer.promise().on_success(move |_| chained);
        outer.resolve(1);
        let promise = outer.promise();
        let waiter = thread::spawn(move || block_on(promise));
        thread::sleep(Duration::from_millis(20));
        std::mem::drop(inner);
        assert_eq!(waiter.join().expect("The waiter thread has panicked"), Err(Error::Abandoned));
        assert_eq!(outer.status(), Status::Pending);
    }

    #[test]
    fn test_await_after_propagated_panic() {
        let deferred = Deferred::<i32, String>::builder().catch_panics(false).build();
        let promise = deferred.promise();
        promise.on_success(|v| {
            if v > 0 {
                panic!("bad continuation");
            }
        });
        let waiting = promise.clone();
        let waiter = thread::spawn(move || block_on(waiting));
        thread::sleep(Duration::from_millis(20));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| deferred.resolve(1)));
        assert!(result.is_err());
        assert_eq!(waiter.join().expect("The waiter thread has panicked"), Err(Error::Abandoned));
    }

    #[test]
    fn test_flattening_long_settled_chain() {
        let log = Log::default();
        let outer = defer::<i32, String>();
        let promise = outer.promise();
        for i in 1..=10_000 {
            let inner = defer::<i32, String>();
            inner.resolve(i);
            let chained = inner.promise();
            promise.on_success(move |_| chained);
        }
        promise.on_success(record(&log, "last"));
        let resolver = thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || outer.resolve(0))
            .expect("failed to spawn resolver thread");
        resolver.join().expect("The resolver thread has panicked");
        assert_eq!(*log.lock().unwrap(), vec!["last(10000)"]);
    }

    #[test]
    fn test_drop_after_settle_is_not_abandoned() {
        let deferred = defer::<i32, String>();
        let promise = deferred.promise();
        deferred.resolve(1);
        std::mem::drop(deferred);
        assert_eq!(block_on(promise), Ok(1));
    }
}
