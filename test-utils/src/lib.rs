//! `test-utils` is used for testing in both `netpace-lib` and `netpace-bin`.
//! This crate does not depend on `netpace-lib` or `netpace-bin`, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the dependencies.

/// Create a mock web server, which responds with a predefined status when
/// handling a matching request
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new(http::StatusCode::from($status));
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET")).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Start a WebSocket server on a random local port and return its `ws://`
/// URL.
///
/// Every inbound message except close frames is passed to the responder,
/// a `Fn(Message) -> Option<Message>`; the returned message is sent back.
/// Without a responder the server echoes.
///
/// Requires `tokio`, `futures` and `tokio-tungstenite` in the importing crate.
#[macro_export]
macro_rules! ws_server {
    () => {
        $crate::ws_server!(|message: tokio_tungstenite::tungstenite::Message| Some(message))
    };
    ($respond:expr) => {{
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("cannot bind WebSocket test server");
        let address = listener.local_addr().expect("WebSocket test server has no address");
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    use futures::{SinkExt, StreamExt};

                    let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let respond = $respond;
                    while let Some(Ok(message)) = socket.next().await {
                        // The close reply is flushed by the next read
                        if message.is_close() {
                            continue;
                        }
                        if let Some(reply) = respond(message) {
                            if socket.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        format!("ws://{address}/")
    }};
}
