//! Send path against a mock platform over real HTTP.

use std::{sync::Arc, time::Duration};

use courier_core::{OutboundMessage, RealClock, SharedClock, Target, TenantConfig};
use courier_delivery::{
    CircuitConfig, CredentialConfig, CredentialStore, DeliveryQueue, Dispatcher, PlatformClient, QueueConfig,
    RateLimitConfig, RateLimiter, RetryPolicy,
};
use courier_testing::{directory, MockPlatform, TenantBuilder};

struct Stack {
    credentials: CredentialStore,
    dispatcher: Arc<Dispatcher>,
    tenant: TenantConfig,
}

fn stack(platform: &MockPlatform, clock: SharedClock) -> Stack {
    let tenant = TenantBuilder::new("default").corp_id("wwdelivery").build();
    let api = Arc::new(PlatformClient::new(platform.client_config()).unwrap());
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), clock.clone()));
    let credentials = CredentialStore::new(api.clone(), limiter, clock.clone(), CredentialConfig::default());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(directory([tenant.clone()])),
        credentials.clone(),
        api,
        clock,
        CircuitConfig::default(),
    ));
    Stack { credentials, dispatcher, tenant }
}

fn fast_queue(clock: SharedClock) -> DeliveryQueue {
    let retry = RetryPolicy { base_delay: Duration::from_millis(5), max_delay: Duration::from_millis(50), ..RetryPolicy::default() };
    DeliveryQueue::new(QueueConfig { max_concurrent: 3, retry }, clock)
}

#[tokio::test]
async fn concurrent_token_requests_share_one_issuance() {
    let platform = MockPlatform::start().await;
    platform.slow_token("tok-shared", Duration::from_millis(200), 1).await;
    let stack = stack(&platform, RealClock::shared());

    let requests = (0..10).map(|_| stack.credentials.get_token(&stack.tenant));
    let tokens = futures::future::join_all(requests).await;

    assert!(tokens.iter().all(|t| t.as_deref() == Ok("tok-shared")));
    platform.verify().await;
}

#[tokio::test]
async fn queued_messages_reach_the_platform() {
    let platform = MockPlatform::start().await;
    platform.token("wwdelivery", "tok-1", 1).await;
    platform.accept_sends("tok-1", 3).await;
    let clock = RealClock::shared();
    let stack = stack(&platform, clock.clone());
    let queue = fast_queue(clock);

    for user in ["u1", "u2", "u3"] {
        queue.enqueue(OutboundMessage::text(Target::user(user), format!("hi {user}")), stack.dispatcher.send_fn("default"));
    }
    queue.wait_idle().await;

    let status = queue.status();
    assert_eq!(status.stats.total, 3);
    assert_eq!(status.stats.success, 3);
    assert_eq!(status.dead_letters, 0);

    let mut recipients: Vec<String> =
        platform.sent_messages().await.iter().map(|m| m["touser"].as_str().unwrap().to_owned()).collect();
    recipients.sort();
    assert_eq!(recipients, ["u1", "u2", "u3"]);
    for message in platform.sent_messages().await {
        assert_eq!(message["msgtype"], "text");
        assert_eq!(message["agentid"], 1_000_002);
    }
    platform.verify().await;
}

#[tokio::test]
async fn permanent_platform_errors_dead_letter_without_retrying() {
    let platform = MockPlatform::start().await;
    platform.token("wwdelivery", "tok-1", 1).await;
    platform.reject_sends(81013, "user, party and tag all invalid").await;
    let clock = RealClock::shared();
    let stack = stack(&platform, clock.clone());
    let queue = fast_queue(clock);

    let task_id = queue.enqueue(OutboundMessage::text(Target::user("ghost"), "hello"), stack.dispatcher.send_fn("default"));
    queue.wait_idle().await;

    let dead = queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, task_id);
    assert_eq!(dead[0].attempts, 1);
    assert!(dead[0].last_error.contains("81013"));
    assert_eq!(platform.sent_messages().await.len(), 1);
}

#[tokio::test]
async fn transient_errors_are_retried_then_dead_lettered() {
    let platform = MockPlatform::start().await;
    platform.token("wwdelivery", "tok-1", 1).await;
    platform.reject_sends(-1, "system busy").await;
    let clock = RealClock::shared();
    let stack = stack(&platform, clock.clone());
    let queue = fast_queue(clock);

    queue.enqueue(OutboundMessage::text(Target::user("u1"), "hello"), stack.dispatcher.send_fn("default"));
    queue.wait_idle().await;

    let status = queue.status();
    assert_eq!(status.stats.retries, 3);
    assert_eq!(status.stats.dead_lettered, 1);
    assert_eq!(platform.sent_messages().await.len(), 4);
}
