//! An async client behind a tower concurrency limit, with one call cancelled by its caller.
use callguard::{AsyncClient, ClientOverrideConfig, SdkError, SdkRequest, SdkResponse};
use std::time::Duration;
use tower::{Service, ServiceBuilder, ServiceExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let service = tower::service_fn(|request: SdkRequest| async move {
        // Replace with your real HTTP client
        if request.uri().ends_with("/slow") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok::<_, SdkError>(SdkResponse::ok())
    });
    let client = AsyncClient::from_service(service)
        .override_config(
            ClientOverrideConfig::builder()
                .api_call_timeout(Duration::from_secs(2))
                .api_call_attempt_timeout(Duration::from_millis(500))
                .build(),
        )
        .build()?;

    let mut limited = ServiceBuilder::new().concurrency_limit(4).service(client.clone());
    let response = limited.ready().await?.call(SdkRequest::get("https://example.test/fast")).await?;
    println!("fast path: {}", response.status());

    match client.execute(SdkRequest::get("https://example.test/slow")).await {
        Ok(response) => println!("slow path: {}", response.status()),
        Err(err) => println!("slow path gave up: {err}"),
    }

    let call = client.execute(SdkRequest::get("https://example.test/slow"));
    call.cancel();
    if let Err(err) = call.await {
        println!("cancelled call: {err} (cancelled by caller: {})", err.is_cancelled_by_caller());
    }
    Ok(())
}
