//! Echo client - binds, sends one request, prints the echo, unbinds.
//!
//! Run `echo_server` first, then:
//!
//! ```sh
//! cargo run --example echo_client
//! ```

use std::time::Duration;

use seqwire::{Client, ClientOptions, FnProtocolHandler, Response, StreamRequest};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,seqwire=debug".into()),
        )
        .init();

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    let client = Client::new(
        "127.0.0.1:7400".parse()?,
        "echo-client",
        ClientOptions {
            auto_reconnect: false,
            ..ClientOptions::default()
        },
        move |bind_resp, session| {
            tracing::info!(server = %bind_resp.system_id, "bound");

            let done = done_tx.clone();
            let unbind = session.clone();
            session.set_protocol_handler(FnProtocolHandler::new(
                |_request, _seq| Ok(()),
                move |response, seq, status| {
                    if let Response::Stream(stream_resp) = response {
                        tracing::info!(
                            seq,
                            ?status,
                            body = %String::from_utf8_lossy(&stream_resp.body),
                            "echo received"
                        );
                    }
                    unbind.unbind();
                    let _ = done.send(());
                    Ok(())
                },
            ));

            let seq = session
                .send_request_with_timeout(StreamRequest::from("hello"), Duration::from_secs(3))
                .expect("session just bound");
            tracing::info!(seq, "request sent");
        },
        |err| tracing::warn!("client: {err}"),
    );

    client.start();

    done_rx.recv().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.stop();

    Ok(())
}
