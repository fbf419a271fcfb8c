//! Echo server - accepts every bind and echoes stream requests back.
//!
//! Run with:
//!
//! ```sh
//! cargo run --example echo_server
//! ```
//!
//! then point `echo_client` at it.

use seqwire::{CommandStatus, FnProtocolHandler, Request, Server, ServerOptions, StreamResponse};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,seqwire=debug".into()),
        )
        .init();

    let server = Server::bind(
        "127.0.0.1:7400".parse()?,
        "echo-srv",
        ServerOptions::default(),
        |bind_req, session| {
            tracing::info!(system_id = %bind_req.system_id, "peer bound");

            let echo = session.clone();
            session.set_protocol_handler(FnProtocolHandler::new(
                move |request, seq| {
                    if let Request::Stream(stream_req) = request {
                        echo.send_response(
                            StreamResponse::from(stream_req.body),
                            seq,
                            CommandStatus::Rok,
                        )?;
                    }
                    Ok(())
                },
                |_response, _seq, _status| Ok(()),
            ));

            true
        },
    )
    .await?;

    tracing::info!(addr = %server.local_addr(), "echo server listening");
    server.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.stop();

    Ok(())
}
