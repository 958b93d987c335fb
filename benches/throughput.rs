use criterion::{black_box, criterion_group, criterion_main, Criterion};
use provider_failover::{
    CircuitBreaker, CircuitConfig, Classify, Dependency, FailureKind, FallbackChain, RetryPolicy,
};
use std::fmt;
use std::time::Duration;

#[derive(Debug)]
struct BenchError;

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Benchmark error")
    }
}

impl Classify for BenchError {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::ServerError
    }
}

fn successful_operation() -> Result<(), BenchError> {
    Ok(())
}

fn failing_operation() -> Result<(), BenchError> {
    Err(BenchError)
}

fn config(threshold: u32) -> CircuitConfig {
    CircuitConfig::builder()
        .failure_threshold(threshold)
        .recovery_timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}

fn bench_circuit_breaker_closed(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("bench", config(5));

    c.bench_function("circuit_breaker_closed_success", |b| {
        b.iter(|| black_box(breaker.call(successful_operation)));
    });
}

fn bench_circuit_breaker_transition(c: &mut Criterion) {
    let breaker = CircuitBreaker::new("bench", config(5));

    c.bench_function("circuit_breaker_transition", |b| {
        b.iter_custom(|iters| {
            let start = std::time::Instant::now();

            for _ in 0..iters {
                breaker.reset();

                // Five failing calls trip the breaker
                for _ in 0..5 {
                    let _ = black_box(breaker.call(failing_operation));
                }

                // One open-circuit rejection
                let _ = black_box(breaker.call(successful_operation));
            }

            start.elapsed()
        });
    });
}

fn bench_circuit_breaker_concurrent(c: &mut Criterion) {
    use std::sync::{Arc, Barrier};
    use std::thread;

    // High threshold to avoid tripping
    let breaker = CircuitBreaker::new("bench", config(100));

    const THREAD_COUNT: usize = 4;
    const ITERATIONS_PER_THREAD: usize = 1000;

    c.bench_function("circuit_breaker_concurrent", |b| {
        b.iter(|| {
            let barrier = Arc::new(Barrier::new(THREAD_COUNT + 1));
            let mut handles = Vec::with_capacity(THREAD_COUNT);

            for _ in 0..THREAD_COUNT {
                let thread_breaker = breaker.clone();
                let thread_barrier = Arc::clone(&barrier);

                handles.push(thread::spawn(move || {
                    thread_barrier.wait();
                    for _ in 0..ITERATIONS_PER_THREAD {
                        let _ = black_box(thread_breaker.call(successful_operation));
                    }
                }));
            }

            barrier.wait();

            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

fn bench_chain_skip_open_primary(c: &mut Criterion) {
    let chain = FallbackChain::builder(|dep: &Dependency| Ok::<_, BenchError>(dep.priority()))
        .retry(RetryPolicy::no_retry())
        .dependency(Dependency::new("primary", "openai"), config(1))
        .dependency(Dependency::new("secondary", "anthropic").with_priority(1), config(1))
        .build()
        .unwrap();
    chain
        .breaker("primary")
        .unwrap()
        .record_failure(FailureKind::ServerError);

    // Includes the timeout worker thread of every admitted attempt
    c.bench_function("chain_skip_open_primary", |b| {
        b.iter(|| black_box(chain.call(|priority: &i32, _: &Dependency| Ok(*priority))));
    });
}

criterion_group!(
    benches,
    bench_circuit_breaker_closed,
    bench_circuit_breaker_transition,
    bench_circuit_breaker_concurrent,
    bench_chain_skip_open_primary
);
criterion_main!(benches);
