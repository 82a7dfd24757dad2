//! End-to-end delivery against a mock collection service

use perfmon_agent::sampler::ScopeSamplerFactory;
use perfmon_agent::{
    Config, ProfilerManager, ProfilingSession, RequestContext, ResponseContext, SharedConfig,
    Transmitter,
};
use std::time::{Duration, Instant};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn accepted() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({"code": 0, "msg": "success"}))
}

fn config(server: &MockServer) -> Config {
    Config {
        sampling_rate: 1.0,
        exclude_patterns: Vec::new(),
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(50),
        request_timeout: Duration::from_secs(2),
        ..Config::new("pk_integration", server.uri())
    }
}

fn body(request: &Request) -> serde_json::Value {
    serde_json::from_slice(&request.body).unwrap()
}

/// Poll the mock server until `count` requests arrived or `timeout` passed
async fn wait_for_requests(server: &MockServer, count: usize, timeout: Duration) -> Vec<Request> {
    let deadline = Instant::now() + timeout;
    loop {
        let received = server.received_requests().await.unwrap_or_default();
        if received.len() >= count || Instant::now() >= deadline {
            return received;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_mode_delivers_matching_trace_id() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/performance/collect"))
        .and(header("X-Project-Key", "pk_integration"))
        .respond_with(accepted())
        .expect(1)
        .mount(&server)
        .await;

    let manager = ProfilerManager::new(Config {
        async_send: false,
        ..config(&server)
    })
    .unwrap();

    let trace_id = manager
        .start_profiling(&RequestContext::new("GET", "/api/x").header("Authorization", "Bearer s3cret"))
        .unwrap();
    assert!(manager.stop_profiling(&ResponseContext::new(200).response_size(17)));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);

    let request = &received[0];
    let user_agent = request.headers.get("user-agent").unwrap().to_str().unwrap();
    assert!(user_agent.starts_with("performance-monitor-sdk/"));

    let record = body(request);
    assert_eq!(record["trace_id"], trace_id.as_str());
    assert_eq!(record["request_info"]["path"], "/api/x");
    assert_eq!(record["request_info"]["headers"]["Authorization"], "[FILTERED]");
    assert_eq!(record["response_info"]["response_size"], 17);

    manager.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_batch_is_sent_immediately() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/performance/batch"))
        .respond_with(accepted())
        .mount(&server)
        .await;

    let manager = ProfilerManager::new(Config {
        batch_size: 3,
        batch_timeout: Duration::from_secs(60),
        ..config(&server)
    })
    .unwrap();

    let mut trace_ids = Vec::new();
    for _ in 0..3 {
        trace_ids.push(manager.start_profiling(&RequestContext::new("GET", "/api/x")).unwrap());
        assert!(manager.stop_profiling(&ResponseContext::default()));
    }

    let received = wait_for_requests(&server, 1, Duration::from_secs(5)).await;
    assert_eq!(received.len(), 1);

    let payload = body(&received[0]);
    assert_eq!(payload["batch_size"], 3);
    let sent: Vec<_> = payload["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["trace_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(sent, trace_ids);

    manager.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lone_record_is_sent_after_batch_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/performance/batch"))
        .respond_with(accepted())
        .mount(&server)
        .await;

    let manager = ProfilerManager::new(Config {
        batch_size: 10,
        batch_timeout: Duration::from_millis(300),
        ..config(&server)
    })
    .unwrap();

    let trace_id = manager.start_profiling(&RequestContext::new("GET", "/api/x")).unwrap();
    assert!(manager.stop_profiling(&ResponseContext::default()));

    let received = wait_for_requests(&server, 1, Duration::from_secs(5)).await;
    assert_eq!(received.len(), 1);

    let payload = body(&received[0]);
    assert_eq!(payload["batch_size"], 1);
    assert_eq!(payload["records"][0]["trace_id"], trace_id.as_str());

    manager.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_endpoint_is_retried_then_given_up() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/performance/collect"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = Config {
        retry_times: 2,
        ..config(&server)
    };
    let record = ProfilingSession::start(&RequestContext::new("GET", "/api/x"), &ScopeSamplerFactory)
        .unwrap()
        .stop(&ResponseContext::default(), &config)
        .unwrap();
    let transmitter = Transmitter::new(SharedConfig::new(config)).unwrap();

    assert!(!transmitter.send_sync(&record));

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 3);
    assert_eq!(transmitter.stats().dropped, 1);

    transmitter.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_envelope_counts_as_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"code": 20003, "msg": "invalid project key"})),
        )
        .mount(&server)
        .await;

    let manager = ProfilerManager::new(Config {
        async_send: false,
        retry_times: 0,
        ..config(&server)
    })
    .unwrap();

    manager.start_profiling(&RequestContext::new("GET", "/api/x")).unwrap();
    // A record was produced even though delivery failed
    assert!(manager.stop_profiling(&ResponseContext::default()));

    let stats = manager.transmitter().stats();
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.dropped, 1);

    manager.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_flushes_pending_batch() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/performance/batch"))
        .respond_with(accepted())
        .expect(1)
        .mount(&server)
        .await;

    let manager = ProfilerManager::new(Config {
        batch_size: 50,
        batch_timeout: Duration::from_secs(60),
        ..config(&server)
    })
    .unwrap();

    for _ in 0..4 {
        manager.start_profiling(&RequestContext::new("GET", "/api/x")).unwrap();
        manager.stop_profiling(&ResponseContext::default());
    }
    manager.close();

    let stats = manager.transmitter().stats();
    assert_eq!(stats.sent, 4);
    assert_eq!(stats.pending, 0);
}
