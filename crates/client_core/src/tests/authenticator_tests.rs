use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use futures::future::join_all;

use super::*;
use crate::test_support::{session, token_expiring_in};

struct CountingRefresher {
    calls: AtomicUsize,
    delay: Duration,
    next_access: String,
    fail: bool,
}

impl CountingRefresher {
    fn ok(next_access: String) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(30),
            next_access,
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(30),
            next_access: String::new(),
            fail: true,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefreshTransport for CountingRefresher {
    async fn refresh(&self, refresh_token: &str) -> ClientResult<TokenResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(ClientError::Http {
                status: 401,
                message: "refresh rejected".into(),
            });
        }
        assert_eq!(refresh_token, "refresh-1");
        Ok(TokenResponse {
            access_token: self.next_access.clone(),
            refresh_token: "refresh-2".into(),
        })
    }
}

async fn authenticator(access: &str, refresher: Arc<CountingRefresher>) -> Arc<SessionAuthenticator> {
    let tokens = Arc::new(TokenStore::in_memory());
    tokens.save_session(session(access, "refresh-1")).await;
    Arc::new(SessionAuthenticator::new(tokens, refresher))
}

#[tokio::test]
async fn concurrent_proactive_refresh_is_single_flight() {
    let new_access = token_expiring_in(3600);
    let refresher = CountingRefresher::ok(new_access.clone());
    let auth = authenticator(&token_expiring_in(10), refresher.clone()).await;

    let calls = (0..8).map(|_| {
        let auth = Arc::clone(&auth);
        async move { auth.decorate(OutboundRequest::get("/chats")).await }
    });
    let results = join_all(calls).await;

    assert_eq!(refresher.calls(), 1);
    let mut refreshed = 0;
    for (request, outcome) in &results {
        assert_eq!(request.bearer.as_deref(), Some(new_access.as_str()));
        match outcome {
            ProactiveRefresh::Refreshed => refreshed += 1,
            ProactiveRefresh::RefreshedByPeer => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(refreshed, 1);
    assert_eq!(
        auth.tokens().refresh_token().await.as_deref(),
        Some("refresh-2")
    );
}

#[tokio::test]
async fn fresh_token_skips_refresh() {
    let access = token_expiring_in(3600);
    let refresher = CountingRefresher::ok(token_expiring_in(7200));
    let auth = authenticator(&access, refresher.clone()).await;

    let (request, outcome) = auth.decorate(OutboundRequest::get("/chats")).await;

    assert!(matches!(outcome, ProactiveRefresh::NotNeeded));
    assert_eq!(request.bearer.as_deref(), Some(access.as_str()));
    assert_eq!(refresher.calls(), 0);
}

#[tokio::test]
async fn proactive_failure_is_reported_and_request_proceeds() {
    let stale = token_expiring_in(5);
    let refresher = CountingRefresher::failing();
    let auth = authenticator(&stale, refresher.clone()).await;

    let (request, outcome) = auth.decorate(OutboundRequest::get("/chats")).await;

    assert!(matches!(outcome, ProactiveRefresh::Ignored(ClientError::Http { status: 401, .. })));
    assert_eq!(request.bearer.as_deref(), Some(stale.as_str()));
    assert!(auth.is_logged_in().await, "proactive failure must not end the session");
}

#[tokio::test]
async fn blank_proactive_rotation_keeps_the_old_tokens() {
    let stale = token_expiring_in(5);
    let refresher = CountingRefresher::ok(String::new());
    let auth = authenticator(&stale, refresher.clone()).await;

    let (request, outcome) = auth.decorate(OutboundRequest::get("/chats")).await;

    assert!(matches!(outcome, ProactiveRefresh::Ignored(ClientError::EmptyPayload)));
    assert_eq!(request.bearer.as_deref(), Some(stale.as_str()));
    assert_eq!(auth.tokens().access_token().await.as_deref(), Some(stale.as_str()));
    assert_eq!(auth.tokens().refresh_token().await.as_deref(), Some("refresh-1"));
    assert_eq!(refresher.calls(), 1);
}

#[tokio::test]
async fn session_endpoints_carry_refresh_token_or_nothing() {
    let refresher = CountingRefresher::ok(token_expiring_in(3600));
    let auth = authenticator(&token_expiring_in(1), refresher.clone()).await;

    let (logout, _) = auth
        .decorate(OutboundRequest::post(LOGOUT_PATH).with_auth(AuthKind::Refresh))
        .await;
    let (login, _) = auth
        .decorate(OutboundRequest::post("/auth/login").with_auth(AuthKind::None))
        .await;

    assert_eq!(logout.bearer.as_deref(), Some("refresh-1"));
    assert_eq!(login.bearer, None);
    assert_eq!(refresher.calls(), 0);
}

#[tokio::test]
async fn reactive_refresh_retries_with_new_token() {
    let old_access = token_expiring_in(3600);
    let new_access = token_expiring_in(7200);
    let refresher = CountingRefresher::ok(new_access.clone());
    let auth = authenticator(&old_access, refresher.clone()).await;
    let (failed, _) = auth.decorate(OutboundRequest::get("/chats")).await;

    match auth.on_unauthorized(&failed, 1).await {
        UnauthorizedOutcome::Retry(retry) => {
            assert_eq!(retry.bearer.as_deref(), Some(new_access.as_str()));
            assert_eq!(retry.path, "/chats");
        }
        UnauthorizedOutcome::SessionExpired => panic!("expected a retry"),
    }
    assert_eq!(refresher.calls(), 1);
    assert_eq!(auth.tokens().access_token().await, Some(new_access));
}

#[tokio::test]
async fn concurrent_reactive_refresh_is_single_flight() {
    let old_access = token_expiring_in(3600);
    let new_access = token_expiring_in(7200);
    let refresher = CountingRefresher::ok(new_access.clone());
    let auth = authenticator(&old_access, refresher.clone()).await;
    let (failed, _) = auth.decorate(OutboundRequest::get("/chats")).await;

    let calls = (0..5).map(|_| {
        let auth = Arc::clone(&auth);
        let failed = failed.clone();
        async move { auth.on_unauthorized(&failed, 1).await }
    });
    let outcomes = join_all(calls).await;

    assert_eq!(refresher.calls(), 1);
    for outcome in outcomes {
        match outcome {
            UnauthorizedOutcome::Retry(retry) => {
                assert_eq!(retry.bearer.as_deref(), Some(new_access.as_str()))
            }
            UnauthorizedOutcome::SessionExpired => panic!("expected a retry"),
        }
    }
}

#[tokio::test]
async fn second_unauthorized_response_is_terminal() {
    let refresher = CountingRefresher::ok(token_expiring_in(7200));
    let auth = authenticator(&token_expiring_in(3600), refresher.clone()).await;
    let mut expired = auth.subscribe_session_expired();
    let (failed, _) = auth.decorate(OutboundRequest::get("/chats")).await;

    let outcome = auth.on_unauthorized(&failed, 2).await;

    assert!(matches!(outcome, UnauthorizedOutcome::SessionExpired));
    assert_eq!(refresher.calls(), 0);
    assert!(!auth.is_logged_in().await);
    assert_eq!(expired.try_recv().expect("signal"), SessionExpired);
}

#[tokio::test]
async fn refresh_endpoint_cannot_refresh_itself() {
    let refresher = CountingRefresher::ok(token_expiring_in(7200));
    let auth = authenticator(&token_expiring_in(3600), refresher.clone()).await;
    let request = OutboundRequest::post(REFRESH_PATH).with_auth(AuthKind::Refresh);

    let outcome = auth.on_unauthorized(&request, 1).await;

    assert!(matches!(outcome, UnauthorizedOutcome::SessionExpired));
    assert_eq!(refresher.calls(), 0);
    assert!(!auth.is_logged_in().await);
}

#[tokio::test]
async fn failed_reactive_refresh_expires_session_once() {
    let refresher = CountingRefresher::failing();
    let auth = authenticator(&token_expiring_in(3600), refresher.clone()).await;
    let mut expired = auth.subscribe_session_expired();
    let (failed, _) = auth.decorate(OutboundRequest::get("/chats")).await;

    let calls = (0..3).map(|_| {
        let auth = Arc::clone(&auth);
        let failed = failed.clone();
        async move { auth.on_unauthorized(&failed, 1).await }
    });
    let outcomes = join_all(calls).await;

    assert!(outcomes
        .iter()
        .all(|outcome| matches!(outcome, UnauthorizedOutcome::SessionExpired)));
    assert_eq!(refresher.calls(), 1);
    assert!(!auth.is_logged_in().await);
    assert_eq!(expired.try_recv().expect("signal"), SessionExpired);
    assert!(expired.try_recv().is_err(), "session-expired must be emitted once");
}

#[tokio::test]
async fn unauthorized_without_session_is_terminal() {
    let auth = Arc::new(SessionAuthenticator::new(
        Arc::new(TokenStore::in_memory()),
        Arc::new(MissingRefreshTransport),
    ));
    let mut expired = auth.subscribe_session_expired();

    let outcome = auth.on_unauthorized(&OutboundRequest::get("/chats"), 1).await;

    assert!(matches!(outcome, UnauthorizedOutcome::SessionExpired));
    assert!(expired.try_recv().is_err(), "nothing was cleared, nothing to signal");
}
