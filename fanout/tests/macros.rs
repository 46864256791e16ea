#![cfg(feature = "macros")]

use fanout::{Batch, Engine, Error, ExecutorKind, parallel};
use std::{
    num::ParseIntError,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

#[parallel(workers = 4)]
fn double(x: u32) -> u32 {
    x * 2
}

#[parallel(workers = 2, batch_size = 5)]
fn scale(x: f64, factor: f64, offset: f64) -> f64 {
    x * factor + offset
}

#[parallel(workers = 3, fallible)]
fn parse(text: String) -> Result<i64, ParseIntError> {
    let n = text.trim().parse::<i64>()?;
    Ok(n * 10)
}

#[parallel(workers = 2, rate_limit = "20/second")]
fn stamp(i: usize) -> (usize, Instant) {
    (i, Instant::now())
}

#[parallel(workers = 2)]
fn tally(n: usize, total: Arc<AtomicUsize>) {
    total.fetch_add(n, Ordering::SeqCst);
}

#[parallel(workers = 2)]
fn sum_pair((a, b): (i32, i32)) -> i32 {
    a + b
}

mod helpers {
    pub fn shout(text: &str) -> String {
        text.to_uppercase()
    }
}

#[derive(Clone)]
struct Greeter {
    greeting: String,
}

impl Greeter {
    #[parallel(workers = 2)]
    fn greet(&self, name: &'static str) -> String {
        format!("{}, {name}!", self.greeting)
    }

    #[parallel(workers = 2, fallible)]
    fn greet_checked(&self, name: &'static str) -> Result<String, String> {
        if name.is_empty() {
            return Err("empty name".to_string());
        }
        Ok(self.greet(name).map_err(|e| e.to_string())?.remove(0))
    }

    #[parallel(workers = 2)]
    fn shout(&self, name: &'static str) -> String {
        self::helpers::shout(&format!("{}, {name}", self.greeting))
    }
}

#[test]
fn free_functions_take_batches_and_items() {
    assert_eq!(
        double((1..=10).collect::<Vec<_>>()).unwrap(),
        vec![2, 4, 6, 8, 10, 12, 14, 16, 18, 20]
    );
    assert_eq!(double(21).unwrap(), vec![42]);
    assert_eq!(double([1, 2]).unwrap(), vec![2, 4]);
    assert_eq!(double(Batch::Many(vec![])).unwrap(), Vec::<u32>::new());
}

#[test]
fn extra_arguments_reach_every_task() {
    assert_eq!(
        scale(vec![1.0, 2.0, 3.0], 10.0, 0.5).unwrap(),
        vec![10.5, 20.5, 30.5]
    );
}

#[test]
fn extra_arguments_can_be_shared_state() {
    let total = Arc::new(AtomicUsize::new(0));
    tally(vec![1, 2, 3, 4], Arc::clone(&total)).unwrap();
    assert_eq!(total.load(Ordering::SeqCst), 10);
}

#[test]
fn item_parameters_can_be_patterns() {
    assert_eq!(sum_pair(vec![(1, 2), (3, 4)]).unwrap(), vec![3, 7]);
}

#[test]
fn fallible_functions_fail_on_the_first_error() {
    assert_eq!(
        parse(vec!["1".to_string(), " 2 ".to_string()]).unwrap(),
        vec![10, 20]
    );
    let err = parse(vec!["1".to_string(), "two".to_string(), "3".to_string()]).unwrap_err();
    assert!(matches!(err, Error::Task { index: 1, .. }), "{err}");
    assert!(matches!(parse("x".to_string()), Err(Error::Task { index: 0, .. })));
}

#[test]
fn rate_limited_functions_are_paced() {
    let started = Instant::now();
    let out = stamp(vec![0, 1, 2, 3, 4, 5]).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(240));
    assert_eq!(
        out.into_iter().map(|(i, _)| i).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4, 5]
    );
}

#[test]
fn methods_capture_their_receiver() {
    let greeter = Greeter {
        greeting: "Hello".into(),
    };
    assert_eq!(
        greeter.greet(vec!["Ada", "Grace"]).unwrap(),
        vec!["Hello, Ada!", "Hello, Grace!"]
    );
    assert_eq!(greeter.greet("Linus").unwrap(), vec!["Hello, Linus!"]);
}

#[test]
fn methods_can_use_module_paths() {
    let greeter = Greeter {
        greeting: "Hey".into(),
    };
    assert_eq!(
        greeter.shout(vec!["Ada", "Bo"]).unwrap(),
        vec!["HEY, ADA", "HEY, BO"]
    );
}

#[test]
fn fallible_methods() {
    let greeter = Greeter {
        greeting: "Hi".into(),
    };
    assert_eq!(
        greeter.greet_checked(vec!["Ken"]).unwrap(),
        vec!["Hi, Ken!"]
    );
    assert!(greeter.greet_checked(vec!["Ken", ""]).is_err());
}

#[test]
fn macro_functions_use_the_global_engine() {
    double(vec![1, 2]).unwrap();
    let engine = Engine::global().unwrap();
    let pool = engine
        .registry()
        .get(&fanout::PoolKey::new(ExecutorKind::Thread, 4))
        .unwrap();
    assert_eq!(pool.workers(), 4);
}
