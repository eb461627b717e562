use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, error, warn};

use parley_gateway::MessageRouter;
use parley_gateway::auth::AuthVerifier;
use parley_gateway::connection;
use parley_gateway::store::blocking;

#[derive(Clone)]
pub struct GatewayState {
    pub router: MessageRouter,
    pub auth: Arc<dyn AuthVerifier>,
    /// Soft limit on distinct connected users, checked at upgrade time.
    pub max_connections: usize,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub token: String,
}

/// `GET /ws?token=...`: authenticate, then hand the socket to the gateway.
///
/// Authentication happens before the upgrade, so a bad token gets a plain 401
/// and no socket is ever registered for it.
pub async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match state.auth.verify(&params.token) {
        Ok(claims) => claims,
        Err(e) => {
            debug!("Rejected gateway token: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let users = state.router.stores().users.clone();
    let user_id = claims.sub;
    let user = match blocking(move || users.user_by_id(user_id)).await {
        Ok(Some(user)) => user,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => {
            error!("Gateway user lookup failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // Soft cap: the check and the later register are not atomic, so
    // concurrent upgrades can overshoot by at most the number in flight.
    // A reconnect replaces the user's existing entry and is always admitted.
    let registry = state.router.registry();
    if registry.lookup(user.id).is_none() && registry.len() >= state.max_connections {
        warn!(
            "Rejecting {}: connection limit {} reached",
            user.username, state.max_connections
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let router = state.router.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, router, user))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use axum::{Router, routing::get};
    use futures_util::StreamExt;
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::{self, Message};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
    use uuid::Uuid;

    use parley_db::Database;
    use parley_gateway::auth::JwtAuth;
    use parley_gateway::{ConnectionRegistry, Stores};

    use super::*;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(3);

    struct TestServer {
        addr: SocketAddr,
        db: Arc<Database>,
        auth: Arc<JwtAuth>,
        registry: ConnectionRegistry,
    }

    impl TestServer {
        async fn start(max_connections: usize) -> Self {
            let db = Arc::new(Database::open_in_memory().unwrap());
            let registry = ConnectionRegistry::default();
            let router = MessageRouter::new(registry.clone(), Stores::from_database(db.clone()));
            let auth = Arc::new(JwtAuth::new("test-secret"));

            let app = Router::new().route("/ws", get(ws_upgrade)).with_state(GatewayState {
                router,
                auth: auth.clone(),
                max_connections,
            });

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            Self {
                addr,
                db,
                auth,
                registry,
            }
        }

        /// Create a user and return a token for it.
        fn user(&self, name: &str) -> String {
            let id = Uuid::new_v4();
            self.db.create_user(&id.to_string(), name, "hash").unwrap();
            self.auth.issue(id, name).unwrap()
        }

        async fn connect(&self, token: &str) -> Result<Client, tungstenite::Error> {
            let url = format!("ws://{}/ws?token={}", self.addr, token);
            connect_async(url).await.map(|(ws, _)| ws)
        }

        /// Connect and wait for `ready`, which is queued after registration.
        async fn connect_ready(&self, token: &str) -> Client {
            let mut ws = self.connect(token).await.unwrap();
            let frame = timeout(WAIT, ws.next()).await.unwrap();
            let Some(Ok(Message::Text(text))) = frame else {
                panic!("expected ready, got {:?}", frame);
            };
            let event: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(event["type"], "ready");
            ws
        }

        async fn wait_for_len(&self, len: usize) {
            let registry = self.registry.clone();
            timeout(WAIT, async move {
                while registry.len() != len {
                    sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("registry never reached {} entries", len));
        }
    }

    fn rejected_status(result: Result<Client, tungstenite::Error>) -> u16 {
        match result {
            Err(tungstenite::Error::Http(resp)) => resp.status().as_u16(),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("upgrade was accepted"),
        }
    }

    async fn expect_closed(ws: &mut Client) {
        let next = timeout(WAIT, ws.next()).await.expect("socket stayed open");
        assert!(
            matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))),
            "unexpected frame {:?}",
            next
        );
    }

    #[tokio::test]
    async fn reconnect_closes_the_previous_socket() {
        let server = TestServer::start(10).await;
        let token = server.user("alice");

        let mut first = server.connect_ready(&token).await;
        let _second = server.connect_ready(&token).await;

        expect_closed(&mut first).await;
        // The old connection's teardown must not evict the new entry.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(server.registry.len(), 1);
        assert_eq!(server.registry.stats().superseded, 1);
    }

    #[tokio::test]
    async fn client_close_unregisters() {
        let server = TestServer::start(10).await;
        let token = server.user("alice");

        let mut ws = server.connect_ready(&token).await;
        assert_eq!(server.registry.len(), 1);

        ws.close(None).await.unwrap();
        server.wait_for_len(0).await;
    }

    #[tokio::test]
    async fn registry_shutdown_ends_both_loops() {
        let server = TestServer::start(10).await;
        let mut ws = server.connect_ready(&server.user("alice")).await;

        server.registry.shutdown();

        expect_closed(&mut ws).await;
        server.wait_for_len(0).await;
    }

    #[tokio::test]
    async fn bad_token_is_rejected_before_registration() {
        let server = TestServer::start(10).await;

        assert_eq!(rejected_status(server.connect("garbage").await), 401);
        assert_eq!(rejected_status(server.connect("").await), 401);

        // Well-formed token for a user that does not exist.
        let ghost = server.auth.issue(Uuid::new_v4(), "ghost").unwrap();
        assert_eq!(rejected_status(server.connect(&ghost).await), 401);

        assert!(server.registry.is_empty());
    }

    #[tokio::test]
    async fn full_server_admits_reconnects_only() {
        let server = TestServer::start(1).await;
        let alice = server.user("alice");
        let bob = server.user("bob");

        let _first = server.connect_ready(&alice).await;

        assert_eq!(rejected_status(server.connect(&bob).await), 503);

        let _again = server.connect_ready(&alice).await;
        assert_eq!(server.registry.len(), 1);
    }
}
