//! Hooks module tests

use std::sync::atomic::{AtomicUsize, Ordering};

use super::auth::AllowHook;
use super::*;

struct DenyHook;

#[async_trait]
impl Hook for DenyHook {
    fn id(&self) -> &str {
        "deny"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(event, HookEvent::OnConnectAuthenticate | HookEvent::OnAclCheck)
    }
}

/// Denies the username "bad", allows everyone else
struct DenyBadHook;

#[async_trait]
impl Hook for DenyBadHook {
    fn id(&self) -> &str {
        "deny-bad"
    }

    fn provides(&self, event: HookEvent) -> bool {
        event == HookEvent::OnConnectAuthenticate
    }

    async fn on_connect_authenticate(&self, _client: &ClientInfo, connect: &Connect) -> bool {
        connect.username.as_deref() != Some("bad")
    }
}

struct PanicHook;

#[async_trait]
impl Hook for PanicHook {
    fn id(&self) -> &str {
        "panic"
    }

    fn provides(&self, _event: HookEvent) -> bool {
        true
    }

    async fn on_connect_authenticate(&self, _client: &ClientInfo, _connect: &Connect) -> bool {
        panic!("boom")
    }

    async fn on_published(&self, _client: &ClientInfo, _publish: &Publish) -> HookResult<()> {
        panic!("boom")
    }
}

/// Counts calls and fails on every observational event
#[derive(Default)]
struct CountingHook {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Hook for CountingHook {
    fn id(&self) -> &str {
        "counting"
    }

    fn provides(&self, event: HookEvent) -> bool {
        event == HookEvent::OnPublished
    }

    async fn on_published(&self, _client: &ClientInfo, _publish: &Publish) -> HookResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HookError::Internal("always fails".into()))
    }
}

/// Uppercases payloads, rejects topics under "blocked/"
struct RewriteHook;

#[async_trait]
impl Hook for RewriteHook {
    fn id(&self) -> &str {
        "rewrite"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(event, HookEvent::OnPublish | HookEvent::OnSubscribe)
    }

    async fn on_publish(&self, _client: &ClientInfo, mut publish: Publish) -> HookResult<Publish> {
        if publish.topic.starts_with("blocked/") {
            return Err(HookError::Rejected);
        }
        publish.payload = publish.payload.to_ascii_uppercase().into();
        Ok(publish)
    }

    async fn on_subscribe(
        &self,
        _client: &ClientInfo,
        mut requests: Vec<SubscribeRequest>,
    ) -> HookResult<Vec<SubscribeRequest>> {
        for request in &mut requests {
            if request.filter.starts_with("private/") {
                request.denied = true;
            }
            request.qos = request.qos.min(QoS::AtLeastOnce);
        }
        Ok(requests)
    }
}

/// Tries to raise every granted QoS
struct GreedyHook;

#[async_trait]
impl Hook for GreedyHook {
    fn id(&self) -> &str {
        "greedy"
    }

    fn provides(&self, event: HookEvent) -> bool {
        event == HookEvent::OnSubscribe
    }

    async fn on_subscribe(
        &self,
        _client: &ClientInfo,
        mut requests: Vec<SubscribeRequest>,
    ) -> HookResult<Vec<SubscribeRequest>> {
        for request in &mut requests {
            request.qos = QoS::ExactlyOnce;
        }
        Ok(requests)
    }
}

fn connect(username: Option<&str>) -> Connect {
    Connect {
        client_id: "client1".into(),
        username: username.map(String::from),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_gates_fail_closed_without_hooks() {
    let hooks = Hooks::new();
    let client = ClientInfo::internal();

    assert!(!hooks.on_connect_authenticate(&client, &connect(None)).await);
    assert!(!hooks.on_acl_check(&client, "a/b", Access::Write).await);
}

#[tokio::test]
async fn test_allow_hook_opens_gates() {
    let hooks = Hooks::new();
    hooks.add_hook(AllowHook, None).unwrap();
    let client = ClientInfo::internal();

    assert!(hooks.on_connect_authenticate(&client, &connect(None)).await);
    assert!(hooks.on_acl_check(&client, "a/b", Access::Read).await);
}

#[tokio::test]
async fn test_first_rejection_wins() {
    let hooks = Hooks::new();
    hooks.add_hook(DenyBadHook, None).unwrap();
    hooks.add_hook(AllowHook, None).unwrap();
    let client = ClientInfo::internal();

    assert!(!hooks.on_connect_authenticate(&client, &connect(Some("bad"))).await);
    assert!(hooks.on_connect_authenticate(&client, &connect(Some("good"))).await);

    let hooks = Hooks::new();
    hooks.add_hook(AllowHook, None).unwrap();
    hooks.add_hook(DenyHook, None).unwrap();
    assert!(!hooks.on_acl_check(&client, "a", Access::Write).await);
}

#[tokio::test]
async fn test_panicking_gate_rejects() {
    let hooks = Hooks::new();
    hooks.add_hook(AllowHook, None).unwrap();
    hooks.add_hook(PanicHook, None).unwrap();

    assert!(
        !hooks
            .on_connect_authenticate(&ClientInfo::internal(), &connect(None))
            .await
    );
}

#[tokio::test]
async fn test_observational_failures_do_not_stop_others() {
    let first = CountingHook::default();
    let second = CountingHook::default();
    let first_calls = first.calls.clone();
    let second_calls = second.calls.clone();

    let hooks = Hooks::new();
    hooks.add_hook(first, None).unwrap();
    hooks.add_hook(PanicHook, None).unwrap();
    hooks.add_hook(second, None).unwrap();

    let publish = Publish::new("t", "x", QoS::AtMostOnce);
    hooks.on_published(&ClientInfo::internal(), &publish).await;

    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_only_providing_hooks_are_called() {
    let counting = CountingHook::default();
    let calls = counting.calls.clone();
    let hooks = Hooks::new();
    hooks.add_hook(counting, None).unwrap();

    hooks.on_started().await;
    hooks.on_client_expired("c").await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(hooks.provides(HookEvent::OnPublished));
    assert!(!hooks.provides(HookEvent::OnStarted));
}

#[tokio::test]
async fn test_on_publish_chain() {
    let hooks = Hooks::new();
    hooks.add_hook(RewriteHook, None).unwrap();
    let client = ClientInfo::internal();

    let out = hooks
        .on_publish(&client, Publish::new("a", "hi", QoS::AtMostOnce))
        .await
        .unwrap();
    assert_eq!(out.payload, "HI");

    let rejected = hooks
        .on_publish(&client, Publish::new("blocked/x", "hi", QoS::AtMostOnce))
        .await;
    assert!(rejected.is_none());
}

#[tokio::test]
async fn test_on_subscribe_never_raises_qos() {
    let hooks = Hooks::new();
    hooks.add_hook(RewriteHook, None).unwrap();
    hooks.add_hook(GreedyHook, None).unwrap();

    let requests = vec![
        SubscribeRequest::new("a/#", QoS::ExactlyOnce),
        SubscribeRequest::new("private/x", QoS::AtMostOnce),
    ];
    let out = hooks.on_subscribe(&ClientInfo::internal(), requests).await;

    assert_eq!(out[0].qos, QoS::AtLeastOnce);
    assert!(!out[0].denied);
    assert_eq!(out[1].qos, QoS::AtMostOnce);
    assert!(out[1].denied);
}

#[test]
fn test_init_rejects_unexpected_options() {
    let hooks = Hooks::new();
    let result = hooks.add_hook(AllowHook, Some(&"options"));
    assert!(matches!(result, Err(HookError::InvalidOptions(_))));
    assert!(hooks.is_empty());
}
