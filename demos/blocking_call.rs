//! A blocking client retrying a flaky transport under a call deadline.
use callguard::{
    CancellationToken, ClientOverrideConfig, Jitter, LogSink, RetryStrategy, SdkError, SdkRequest,
    SdkResponse, ServiceFault, SyncClient,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let sent = AtomicU32::new(0);
    let transport = move |request: &SdkRequest, _: &CancellationToken| {
        // Replace with your real blocking HTTP call
        if sent.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(SdkError::from(ServiceFault::new(503, "service unavailable")));
        }
        println!("sending {} {}", request.method(), request.uri());
        Ok(SdkResponse::ok())
    };

    let client = SyncClient::builder(transport)
        .retry_strategy(
            RetryStrategy::builder()
                .max_attempts(3)
                .base_delay(Duration::from_millis(50))
                .with_jitter(Jitter::full())
                .build()?,
        )
        .override_config(
            ClientOverrideConfig::builder()
                .api_call_timeout(Duration::from_secs(5))
                .api_call_attempt_timeout(Duration::from_secs(1))
                .build(),
        )
        .event_sink(LogSink)
        .build()?;

    let response = client.execute(SdkRequest::get("https://example.test/items"))?;
    let capacity = client.retry_strategy().token_bucket().current();
    println!("status {} after retries, capacity left {capacity}", response.status());
    Ok(())
}
