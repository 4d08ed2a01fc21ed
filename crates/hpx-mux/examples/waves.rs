//! Waves Subscription Example
//!
//! Subscribes to a feed on a shared connection and completes it after a few
//! responses.
//!
//! Run with: `cargo run -p hpx-mux --example waves -- ws://127.0.0.1:8080 givemewaves 3`

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use hpx_mux::{LazyConnectionManager, MuxConfig, SubscriptionCompleter, SubscriptionMultiplexer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| "ws://127.0.0.1:8080".to_string());
    let request = args.next().unwrap_or_else(|| "givemewaves".to_string());
    let limit: usize = args.next().map_or(Ok(3), |n| n.parse())?;

    let manager = LazyConnectionManager::new(MuxConfig::new(url))?;
    let mux = SubscriptionMultiplexer::new(manager);

    let received = Arc::new(AtomicUsize::new(0));
    let subscription = mux.subscribe(request, {
        let received = Arc::clone(&received);
        move |payload: String, completer: &SubscriptionCompleter| {
            let count = received.fetch_add(1, Ordering::SeqCst) + 1;
            println!("[{count}] {payload}");
            if count >= limit {
                completer.complete();
            }
        }
    });

    subscription.wait().await?;
    println!(
        "Subscription completed after {} responses",
        received.load(Ordering::SeqCst)
    );
    Ok(())
}
