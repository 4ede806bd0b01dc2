// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! End-to-end rotation scenarios driven through the client facade with a
//! scripted in-memory provider.
//!
//! Run with: `cargo test -p keyflow --test rotation_scenarios`

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use futures::StreamExt;
use keyflow::{
    CapCooldown, CapLimit, ChunkStream, ClassifiedError, Client, CustomCap, ErrorKind,
    ExecuteOptions, FairCycleConfig, Provider, ProviderConfig, ProviderResponse, RequestContext,
    RotationMode, StreamChunk, TierKey, TokenCounts, WindowDefinition, WindowScope,
};

/// Scripted outcome for one upstream call
enum Outcome {
    Ok,
    Err(ClassifiedError),
}

/// A provider whose upstream effect is a queue of scripted outcomes.
/// Outcomes beyond the script are successes. Every call is logged by
/// accessor.
struct ScriptedProvider {
    credentials: Vec<String>,
    config: ProviderConfig,
    quota_group: Option<String>,
    response_headers: HashMap<String, String>,
    script: Mutex<VecDeque<Outcome>>,
    calls: Mutex<Vec<String>>,
    call_delay: Option<Duration>,
    streaming: bool,
}

impl ScriptedProvider {
    fn new(credentials: &[&str], config: ProviderConfig) -> Self {
        Self {
            credentials: credentials.iter().map(|c| (*c).to_string()).collect(),
            config,
            quota_group: None,
            response_headers: HashMap::new(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            call_delay: None,
            streaming: false,
        }
    }

    fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    fn with_quota_group(mut self, group: &str) -> Self {
        self.quota_group = Some(group.to_string());
        self
    }

    fn with_response_header(mut self, name: &str, value: &str) -> Self {
        self.response_headers
            .insert(name.to_string(), value.to_string());
        self
    }

    fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    fn push_failures(&self, count: usize, error: &ClassifiedError) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(Outcome::Err(error.clone()));
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "acme"
    }

    fn credentials(&self) -> Vec<String> {
        self.credentials.clone()
    }

    fn credential_priority(&self, _accessor: &str) -> Option<i32> {
        Some(1)
    }

    fn quota_group(&self, _model: &str) -> Option<String> {
        self.quota_group.clone()
    }

    fn usage_config(&self) -> ProviderConfig {
        self.config.clone()
    }

    async fn execute(
        &self,
        _ctx: &RequestContext,
        accessor: &str,
        _payload: &Value,
    ) -> Result<ProviderResponse, ClassifiedError> {
        self.calls.lock().push(accessor.to_string());
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        match self.script.lock().pop_front() {
            Some(Outcome::Err(error)) => Err(error),
            Some(Outcome::Ok) | None => {
                let mut response = ProviderResponse::ok(json!({"content": "ok"}));
                for (name, value) in &self.response_headers {
                    response.headers.insert(name.clone(), value.clone());
                }
                Ok(response)
            }
        }
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn execute_streaming(
        &self,
        _ctx: &RequestContext,
        accessor: &str,
        _payload: &Value,
    ) -> Result<ChunkStream, ClassifiedError> {
        self.calls.lock().push(accessor.to_string());
        match self.script.lock().pop_front() {
            Some(Outcome::Err(error)) => Err(error),
            Some(Outcome::Ok) | None => {
                let chunks = vec![
                    Ok(StreamChunk {
                        body: json!({"delta": "hel"}),
                        tokens: None,
                    }),
                    Ok(StreamChunk {
                        body: json!({"delta": "lo"}),
                        tokens: Some(TokenCounts {
                            prompt: 7,
                            completion: 2,
                            ..TokenCounts::default()
                        }),
                    }),
                ];
                Ok(Box::pin(futures::stream::iter(chunks)) as ChunkStream)
            }
        }
    }
}

fn client_with(provider: ScriptedProvider) -> (Client, Arc<ScriptedProvider>) {
    let provider = Arc::new(provider);
    let client = Client::builder()
        .with_provider(Arc::clone(&provider) as Arc<dyn Provider>)
        .build();
    (client, provider)
}

fn quota_error(cooldown: f64) -> ClassifiedError {
    ClassifiedError::of_kind(ErrorKind::QuotaExceeded, "quota exhausted").with_cooldown(cooldown)
}

// ============================================================================
// S1: balanced rotation under equal load
// ============================================================================

#[tokio::test]
async fn balanced_rotation_spreads_equal_load() {
    let config = ProviderConfig {
        rotation_tolerance: 0.0,
        ..ProviderConfig::default()
    };
    let (client, provider) = client_with(ScriptedProvider::new(&["sk-a", "sk-b", "sk-c"], config));

    for _ in 0..30 {
        client
            .execute("acme", "acme-large", &json!({}), None)
            .await
            .unwrap();
    }

    let calls = provider.calls();
    assert_eq!(calls.len(), 30);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for accessor in &calls {
        *counts.entry(accessor.as_str()).or_default() += 1;
    }
    // Tolerance 0 keeps the pool tightly balanced: ten requests each, give
    // or take the randomness of tie-breaking
    for accessor in ["sk-a", "sk-b", "sk-c"] {
        let count = counts.get(accessor).copied().unwrap_or(0);
        assert!(
            (8..=12).contains(&count),
            "{accessor} served {count}/30 requests, expected ~10"
        );
    }
}

// ============================================================================
// S2: sequential stickiness
// ============================================================================

#[tokio::test]
async fn sequential_sticks_until_quota_failure() {
    let config = ProviderConfig {
        rotation_mode: RotationMode::Sequential,
        ..ProviderConfig::default()
    };
    let (client, provider) =
        client_with(ScriptedProvider::new(&["sk-a", "sk-b"], config).with_quota_group("pool"));

    // Five successes all land on the same credential
    for _ in 0..5 {
        client
            .execute("acme", "acme-large", &json!({}), None)
            .await
            .unwrap();
    }
    let calls = provider.calls();
    let first = calls[0].clone();
    assert!(calls.iter().all(|c| *c == first), "stickiness broke: {calls:?}");

    // The sixth request hits a quota wall on the sticky credential, rotates,
    // and finishes on the other one
    provider.push_failures(1, &quota_error(3600.0));
    client
        .execute("acme", "acme-large", &json!({}), None)
        .await
        .unwrap();

    let calls = provider.calls();
    assert_eq!(calls[5], first);
    let second = calls[6].clone();
    assert_ne!(second, first);

    // Requests 7..12 stay on the replacement
    for _ in 0..5 {
        client
            .execute("acme", "acme-large", &json!({}), None)
            .await
            .unwrap();
    }
    let calls = provider.calls();
    assert!(calls[7..].iter().all(|c| *c == second), "{calls:?}");
}

// ============================================================================
// S3: fair cycle exhaustion then reset
// ============================================================================

#[tokio::test]
async fn fair_cycle_resets_when_whole_tier_is_exhausted() {
    let config = ProviderConfig {
        fair_cycle: FairCycleConfig {
            enabled: true,
            duration: 60.0,
            reset_cooldown_threshold: 120.0,
            ..FairCycleConfig::default()
        },
        ..ProviderConfig::default()
    };
    let (client, _provider) =
        client_with(ScriptedProvider::new(&["sk-a", "sk-b"], config).with_quota_group("pool"));

    // Both credentials exhausted behind long quota cooldowns
    client
        .apply_cooldown("acme", "sk-a", 900.0, "quota_exceeded", Some("pool"))
        .unwrap();
    client
        .apply_cooldown("acme", "sk-b", 1200.0, "quota_exceeded", Some("pool"))
        .unwrap();
    client
        .mark_exhausted("acme", "sk-a", "pool", "quota_exceeded")
        .unwrap();
    client
        .mark_exhausted("acme", "sk-b", "pool", "quota_exceeded")
        .unwrap();

    // Every cooldown is far beyond the reset threshold, so selection resets
    // the cycle and the request is served
    let response = client
        .execute("acme", "acme-large", &json!({}), None)
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    let usage = client.usage("acme").unwrap();
    let snapshot = usage.snapshot();
    assert_eq!(snapshot.fair_cycle_global["acme"]["pool"].cycle_count, 1);
}

#[tokio::test]
async fn fair_cycle_waits_for_a_short_cooldown() {
    let config = ProviderConfig {
        fair_cycle: FairCycleConfig {
            enabled: true,
            duration: 60.0,
            reset_cooldown_threshold: 120.0,
            ..FairCycleConfig::default()
        },
        ..ProviderConfig::default()
    };
    let (client, _provider) =
        client_with(ScriptedProvider::new(&["sk-a", "sk-b"], config).with_quota_group("pool"));

    // One cooldown expires in 30s, under the 120s threshold: no reset, the
    // request fails with the pool report instead
    client
        .apply_cooldown("acme", "sk-a", 30.0, "quota_exceeded", Some("pool"))
        .unwrap();
    client
        .apply_cooldown("acme", "sk-b", 1200.0, "quota_exceeded", Some("pool"))
        .unwrap();
    client
        .mark_exhausted("acme", "sk-a", "pool", "quota_exceeded")
        .unwrap();
    client
        .mark_exhausted("acme", "sk-b", "pool", "quota_exceeded")
        .unwrap();

    let error = client
        .execute("acme", "acme-large", &json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(error, keyflow::Error::NoAvailableCredentials { .. }));

    let usage = client.usage("acme").unwrap();
    let snapshot = usage.snapshot();
    let untouched = snapshot
        .fair_cycle_global
        .get("acme")
        .and_then(|cycles| cycles.get("pool"))
        .map_or(true, |cycle| cycle.cycle_count == 0);
    assert!(untouched, "cycle was reset despite a short cooldown");
}

// ============================================================================
// S4: custom cap offset against a learned limit
// ============================================================================

#[tokio::test]
async fn custom_cap_offset_blocks_at_effective_limit() {
    let config = ProviderConfig {
        windows: vec![WindowDefinition::rolling("5h", 5.0 * 3600.0, WindowScope::Group).primary()],
        custom_caps: vec![CustomCap {
            tier: TierKey::Default,
            target: "pool".to_string(),
            limit: CapLimit::Offset(-50),
            cooldown: CapCooldown::QuotaReset,
        }],
        ..ProviderConfig::default()
    };
    // Every success reports the upstream limit of 200 on the primary window
    let (client, provider) = client_with(
        ScriptedProvider::new(&["sk-a"], config)
            .with_quota_group("pool")
            .with_response_header("x-ratelimit-limit", "200"),
    );

    // 150 successes: the effective ceiling (200 - 50) is reached exactly
    for i in 0..150 {
        client
            .execute("acme", "acme-large", &json!({}), None)
            .await
            .unwrap_or_else(|e| panic!("request {i} failed: {e}"));
    }
    assert_eq!(provider.calls().len(), 150);

    // The 151st is blocked by the cap, never reaching the upstream
    let error = client
        .execute("acme", "acme-large", &json!({}), None)
        .await
        .unwrap_err();
    match error {
        keyflow::Error::NoAvailableCredentials { reasons, .. } => {
            let reason = reasons.values().next().unwrap();
            assert!(reason.contains("custom cap"), "unexpected reason: {reason}");
            assert!(reason.contains("150/150"), "unexpected reason: {reason}");
        }
        other => panic!("expected NoAvailableCredentials, got {other:?}"),
    }
    assert_eq!(provider.calls().len(), 150);
}

// ============================================================================
// S5: retry-same on empty responses, then rotation
// ============================================================================

#[tokio::test]
async fn empty_responses_retry_same_then_rotate() {
    let config = ProviderConfig {
        rotation_mode: RotationMode::Sequential,
        ..ProviderConfig::default()
    };
    let (client, provider) = client_with(ScriptedProvider::new(&["sk-a", "sk-b"], config));

    // Three empty responses exhaust the same-credential budget, the fourth
    // attempt runs on the rotated credential
    let empty = ClassifiedError::of_kind(ErrorKind::EmptyResponse, "no content");
    provider.push_failures(3, &empty);

    client
        .execute("acme", "acme-large", &json!({}), None)
        .await
        .unwrap();

    let calls = provider.calls();
    assert_eq!(calls.len(), 4, "{calls:?}");
    let first = calls[0].clone();
    assert!(calls[..3].iter().all(|c| *c == first), "{calls:?}");
    assert_ne!(calls[3], first);

    // Every failed attempt was recorded against the first credential
    let usage = client.usage("acme").unwrap();
    let state = usage.state_snapshot(&first).unwrap();
    assert_eq!(state.totals.failure_count, 3);
    let state = usage.state_snapshot(&calls[3]).unwrap();
    assert_eq!(state.totals.success_count, 1);
}

// ============================================================================
// S6: deadline expiry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn deadline_cancels_without_recording() {
    let (client, provider) = client_with(
        ScriptedProvider::new(&["sk-a"], ProviderConfig::default())
            .with_call_delay(Duration::from_secs(10)),
    );

    let options = ExecuteOptions::default().with_timeout(5.0);
    let error = client
        .execute("acme", "acme-large", &json!({}), Some(options))
        .await
        .unwrap_err();
    assert!(matches!(error, keyflow::Error::DeadlineExceeded { .. }));

    // Exactly one attempt started, nothing was recorded, and the
    // concurrency slot was returned
    assert_eq!(provider.calls().len(), 1);
    let usage = client.usage("acme").unwrap();
    let state = usage.state_snapshot("sk-a").unwrap();
    assert_eq!(state.totals.request_count, 0);
    assert_eq!(state.active_requests, 0);
}

// ============================================================================
// Terminal errors
// ============================================================================

#[tokio::test]
async fn bad_request_fails_without_rotation() {
    let (client, provider) = client_with(ScriptedProvider::new(
        &["sk-a", "sk-b"],
        ProviderConfig::default(),
    ));
    provider.push_failures(1, &ClassifiedError::of_kind(ErrorKind::BadRequest, "schema"));

    let error = client
        .execute("acme", "acme-large", &json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(error, keyflow::Error::InvalidRequest(_)));
    // No second credential was tried
    assert_eq!(provider.calls().len(), 1);
}

#[tokio::test]
async fn auth_errors_rotate_through_the_whole_pool() {
    let (client, provider) = client_with(ScriptedProvider::new(
        &["sk-a", "sk-b"],
        ProviderConfig::default(),
    ));
    let auth = ClassifiedError::of_kind(ErrorKind::AuthError, "revoked");
    provider.push_failures(2, &auth);

    let error = client
        .execute("acme", "acme-large", &json!({}), None)
        .await
        .unwrap_err();
    // Both credentials were tried, then the pool came up empty
    assert_eq!(provider.calls().len(), 2);
    match error {
        keyflow::Error::NoAvailableCredentials { reasons, .. } => {
            assert_eq!(reasons.len(), 2);
            for reason in reasons.values() {
                assert!(
                    reason.contains("cooldown") || reason.contains("already tried"),
                    "unexpected reason: {reason}"
                );
            }
        }
        other => panic!("expected NoAvailableCredentials, got {other:?}"),
    }
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn streaming_records_usage_when_the_stream_ends() {
    let (client, provider) = client_with(
        ScriptedProvider::new(&["sk-a"], ProviderConfig::default()).with_streaming(),
    );

    let mut stream = client
        .execute_streaming("acme", "acme-large", &json!({}), None)
        .await
        .unwrap();

    // Nothing recorded before the stream is consumed
    let usage = client.usage("acme").unwrap();
    assert_eq!(
        usage.state_snapshot("sk-a").unwrap().totals.request_count,
        0
    );

    let mut chunks = Vec::new();
    while let Some(item) = stream.next().await {
        chunks.push(item.unwrap());
    }
    assert_eq!(chunks.len(), 2);
    assert_eq!(provider.calls().len(), 1);

    // Token counts arrived on the final chunk and landed in the totals, and
    // the concurrency slot was returned
    let state = usage.state_snapshot("sk-a").unwrap();
    assert_eq!(state.totals.request_count, 1);
    assert_eq!(state.totals.success_count, 1);
    assert_eq!(state.totals.prompt_tokens, 7);
    assert_eq!(state.totals.completion_tokens, 2);
    assert_eq!(state.active_requests, 0);
}

#[tokio::test]
async fn streaming_rotates_when_the_stream_cannot_start() {
    let (client, provider) = client_with(
        ScriptedProvider::new(&["sk-a", "sk-b"], ProviderConfig::default()).with_streaming(),
    );
    provider.push_failures(1, &quota_error(600.0));

    let mut stream = client
        .execute_streaming("acme", "acme-large", &json!({}), None)
        .await
        .unwrap();
    while let Some(item) = stream.next().await {
        item.unwrap();
    }

    // The quota failure rotated before any chunk was produced
    let calls = provider.calls();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0], calls[1]);
}

#[tokio::test]
async fn streaming_unsupported_is_reported() {
    let (client, _provider) =
        client_with(ScriptedProvider::new(&["sk-a"], ProviderConfig::default()));
    let error = client
        .execute_streaming("acme", "acme-large", &json!({}), None)
        .await
        .err()
        .unwrap();
    assert!(matches!(error, keyflow::Error::StreamingUnsupported(_)));
}

#[tokio::test]
async fn unknown_provider_is_reported() {
    let (client, _provider) =
        client_with(ScriptedProvider::new(&["sk-a"], ProviderConfig::default()));
    let error = client
        .execute("nonexistent", "m", &json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(error, keyflow::Error::UnknownProvider(_)));
}
