//! A three-provider chain in front of a flaky primary.
//!
//! Breaker transitions and fallthroughs are logged at `info`/`warn`:
//! `cargo run --example fallback`

use provider_failover::{
    BreakerRegistry, CircuitConfig, Classify, Dependency, FailoverError, FailureKind,
    FallbackChain, RetryPolicy,
};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Debug)]
enum ProviderError {
    Overloaded,
    RateLimited,
    BadPrompt,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Overloaded => f.write_str("503 overloaded"),
            ProviderError::RateLimited => f.write_str("429 rate limited"),
            ProviderError::BadPrompt => f.write_str("400 bad prompt"),
        }
    }
}

impl Classify for ProviderError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            ProviderError::Overloaded => FailureKind::ServerError,
            ProviderError::RateLimited => FailureKind::RateLimited,
            ProviderError::BadPrompt => FailureKind::InvalidRequest,
        }
    }
}

/// Simulated SDK client: answers, or fails according to its provider.
struct CompletionClient {
    provider: String,
    calls: AtomicU32,
}

impl CompletionClient {
    fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.provider.as_str() {
            // Down for the whole demo
            "openai" => Err(ProviderError::Overloaded),
            // Throttles every third call
            "anthropic" if call % 3 == 2 => Err(ProviderError::RateLimited),
            _ if prompt.is_empty() => Err(ProviderError::BadPrompt),
            provider => Ok(format!("[{provider}] echo: {prompt}")),
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let breaker = CircuitConfig::builder()
        .failure_threshold(2)
        .recovery_timeout(Duration::from_secs(2))
        .half_open_max_calls(1)
        .request_timeout(Duration::from_secs(1))
        .build()
        .expect("valid breaker config");
    let retry = RetryPolicy::new(1, Duration::from_millis(50), Duration::from_millis(200), 2.0)
        .expect("valid retry policy");
    let registry = BreakerRegistry::new();

    let chain = FallbackChain::builder(|dep: &Dependency| {
        Ok::<_, ProviderError>(CompletionClient {
            provider: dep.provider().to_string(),
            calls: AtomicU32::new(0),
        })
    })
    .retry(retry)
    .registry(&registry)
    .dependency(
        Dependency::new("primary", "openai").with_model("gpt-4o"),
        breaker.clone(),
    )
    .dependency(
        Dependency::new("secondary", "anthropic")
            .with_model("claude")
            .with_priority(1),
        breaker.clone(),
    )
    .dependency(
        Dependency::new("local", "ollama").with_priority(2),
        breaker,
    )
    .build()
    .expect("valid chain");

    let prompts = ["hello", "what is a circuit breaker?", "", "bye", "one more"];
    for (i, prompt) in prompts.iter().enumerate() {
        let prompt = prompt.to_string();
        match chain.call(move |client: &CompletionClient, _: &Dependency| client.complete(&prompt)) {
            Ok(answer) => println!("request {i}: {answer}"),
            Err(FailoverError::ChainExhausted {
                attempted, skipped, ..
            }) => println!("request {i}: all providers failed (attempted {attempted:?}, skipped {skipped:?})"),
            Err(err) => println!("request {i}: {err}"),
        }
    }

    println!("\nHealth:");
    let health = chain.health();
    for dep in &health.dependencies {
        println!(
            "  {:<10} priority={} open={} consecutive_failures={}",
            dep.name, dep.priority, dep.circuit_open, dep.consecutive_failures
        );
    }
    println!("  healthy: {}/{}", health.healthy_count, health.dependencies.len());

    println!("\nWaiting for the primary's recovery timeout...");
    thread::sleep(Duration::from_millis(2100));
    for stats in registry.snapshot() {
        println!(
            "  {:<10} state={} total={} ok={} failed={} rejected={}",
            stats.name,
            stats.state,
            stats.total_calls,
            stats.successful_calls,
            stats.failed_calls,
            stats.rejected_calls
        );
    }
}
