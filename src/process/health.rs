//! Readiness probing for freshly spawned editor servers.

use std::time::{Duration, Instant};

use reqwest::Client;

use super::control::is_process_alive;

/// Any HTTP response from the editor means it is bound and serving.
pub(super) async fn check_listening(client: &Client, port: u16) -> bool {
    let url = format!("http://127.0.0.1:{}/healthz", port);
    client.get(&url).send().await.is_ok()
}

/// Wait for an editor to accept connections on `port`.
/// Polls with exponential backoff until success, process exit or timeout.
pub(super) async fn wait_for_startup(
    client: &Client,
    pid: u32,
    port: u16,
    timeout: Duration,
) -> std::result::Result<(), String> {
    let start = Instant::now();
    let mut interval = Duration::from_millis(500);
    let max_interval = Duration::from_secs(2);

    loop {
        if !is_process_alive(pid) {
            return Err(format!("Editor process {} exited during startup", pid));
        }
        if check_listening(client, port).await {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(format!(
                "Editor did not listen on port {} within {}s",
                port,
                timeout.as_secs()
            ));
        }

        tokio::time::sleep(interval.min(timeout - elapsed)).await;
        interval = (interval * 2).min(max_interval);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::builder()
            .no_proxy()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn dead_pid_fails_fast() {
        let started = Instant::now();
        let err = wait_for_startup(&client(), u32::MAX, 1, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(err.contains("exited"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn silent_port_times_out() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = wait_for_startup(&client(), std::process::id(), port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.contains("did not listen"));
    }

    #[tokio::test]
    async fn http_listener_is_ready() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new().route("/healthz", axum::routing::get(|| async { "ok" }));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        wait_for_startup(&client(), std::process::id(), port, Duration::from_secs(5))
            .await
            .unwrap();
    }
}
