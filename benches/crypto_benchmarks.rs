//! Benchmarks for the callback hot path.
//!
//! Every inbound callback pays for one signature check, one AES decrypt, and
//! one envelope parse before a handler runs; the full pipeline is measured
//! through the HTTP router as well.

use std::{hint::black_box, sync::Arc, time::Duration};

use axum::{body::Body, http::Request};
use courier_api::{
    crypto::signature::compute_signature, handler_fn, CallbackProcessor, CallbackQuery, MessageRouter, PayloadCipher,
    Services, SignatureVerifier,
};
use courier_core::{ParsedMessage, RealClock, TestClock};
use courier_delivery::{RateLimitConfig, RateLimiter, RetryPolicy};
use courier_testing::{callback::text_message_xml, config, directory, CallbackBuilder, TenantBuilder, TEST_AES_KEY};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use tower::ServiceExt;

fn bench_signature(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature");
    let verifier = SignatureVerifier::new("bench-token");
    let payload = "x".repeat(512);
    let signature = verifier.sign("1700000000", "nonce", Some(&payload));
    let wrong = "0".repeat(40);

    group.bench_function("compute", |b| {
        b.iter(|| compute_signature(black_box(&["bench-token", "1700000000", "nonce", &payload])));
    });
    group.bench_function("verify_match", |b| {
        b.iter(|| verifier.verify_message("1700000000", "nonce", black_box(&signature), Some(&payload)));
    });
    group.bench_function("verify_mismatch", |b| {
        b.iter(|| verifier.verify_message("1700000000", "nonce", black_box(&wrong), Some(&payload)));
    });

    group.finish();
}

fn bench_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("cipher");
    let cipher = PayloadCipher::new(TEST_AES_KEY).unwrap();

    for size in [64, 1024, 16 * 1024] {
        let content = vec![b'a'; size];
        let sealed = cipher.encrypt(&content).unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", size), &content, |b, content| {
            b.iter(|| cipher.encrypt(black_box(content)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("decrypt", size), &sealed, |b, sealed| {
            b.iter(|| cipher.decrypt(black_box(sealed)).unwrap());
        });
    }

    group.finish();
}

fn bench_message_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_parse");
    let xml = text_message_xml("u1", "hello from the benchmark");
    let json = r#"{"MsgType":"event","FromUserName":"u1","ToUserName":"ww1","Event":"click","EventKey":"menu_1"}"#;

    group.bench_function("xml_text", |b| b.iter(|| ParsedMessage::parse(black_box(&xml)).unwrap()));
    group.bench_function("json_event", |b| b.iter(|| ParsedMessage::parse(black_box(json)).unwrap()));

    group.finish();
}

fn bench_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");
    let clock = TestClock::new();
    let limiter = RateLimiter::new(RateLimitConfig { window: Duration::from_secs(1), max_requests: 1_000 }, clock.shared());
    let policy = RetryPolicy { jitter_factor: 0.1, ..RetryPolicy::default() };

    group.bench_function("rate_limit_check", |b| {
        b.iter(|| {
            clock.advance(Duration::from_millis(1));
            limiter.check(black_box("corp"))
        });
    });
    group.bench_function("backoff_delay", |b| b.iter(|| policy.delay_for(black_box(4))));

    group.finish();
}

fn bench_callback_pipeline(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let tenant = TenantBuilder::new("default").build();
    let mut group = c.benchmark_group("callback");
    group.measurement_time(Duration::from_secs(5));

    let mut router = MessageRouter::new();
    router.set_default(handler_fn(|_, _| async { Ok(None) }));
    let processor =
        CallbackProcessor::new(Arc::new(directory([tenant.clone()])), "default", Arc::new(router), RealClock::shared());
    let callback = CallbackBuilder::for_tenant(&tenant).text_message("u1", "hello");
    let query: CallbackQuery = parse_query(&callback.query);

    group.bench_function("processor", |b| {
        b.to_async(&rt).iter(|| async {
            processor.handle_message(None, &query, black_box(callback.body.as_bytes())).await.unwrap()
        });
    });

    let services = Services::build(&config("http://127.0.0.1:9", &[tenant]), MessageRouter::new(), RealClock::shared())
        .unwrap();
    let app = services.http_router();
    let uri = callback.uri("/callback");

    group.bench_function("http_router", |b| {
        b.to_async(&rt).iter_batched(
            || Request::post(&uri).body(Body::from(callback.body.clone())).unwrap(),
            |request| {
                let app = app.clone();
                async move { app.oneshot(request).await.unwrap() }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

/// Decodes the builder's query string into a [`CallbackQuery`].
fn parse_query(query: &str) -> CallbackQuery {
    let value = |name: &str| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, v)| v.replace("%2B", "+").replace("%2F", "/").replace("%3D", "="))
    };
    CallbackQuery {
        msg_signature: value("msg_signature"),
        timestamp: value("timestamp"),
        nonce: value("nonce"),
        echostr: value("echostr"),
    }
}

criterion_group!(benches, bench_signature, bench_cipher, bench_message_parse, bench_admission, bench_callback_pipeline);
criterion_main!(benches);
