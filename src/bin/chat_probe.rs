// Development client: authenticates, joins the global room, optionally sends a
// message and prints whatever the server pushes back.
//
// usage: chat_probe <session-token> [message]
use futures_util::{SinkExt, StreamExt};
use log::info;
use securechat::common::protocol::{AuthRequest, ClientEvent, NoPayload, SendMessage, ServerEvent};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

fn frame(event: &ClientEvent) -> anyhow::Result<Message> {
    Ok(Message::Text(serde_json::to_string(event)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let token = match args.next() {
        Some(t) => t,
        None => {
            eprintln!("usage: chat_probe <session-token> [message]");
            std::process::exit(2);
        }
    };
    let message = args.next();

    let url = Url::parse(
        &std::env::var("WEBSOCKET_URL").unwrap_or_else(|_| "ws://127.0.0.1:5000".to_string()),
    )?;
    let listen_for = Duration::from_secs(
        std::env::var("PROBE_LISTEN_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5),
    );

    println!("Connecting to {}", url);
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    sink.send(frame(&ClientEvent::Auth(AuthRequest { token }))?).await?;
    match stream.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text)? {
            ServerEvent::AuthResponse(resp) if resp.success => {
                println!("AUTH -> ok, user {}", resp.user_id.unwrap_or_default());
            }
            ServerEvent::AuthResponse(resp) => {
                println!("AUTH -> rejected: {}", resp.error.unwrap_or_default());
                return Ok(());
            }
            other => anyhow::bail!("unexpected first event: {:?}", other),
        },
        other => anyhow::bail!("connection closed during auth: {:?}", other),
    }

    sink.send(frame(&ClientEvent::JoinGlobal(NoPayload))?).await?;
    if let Some(content) = message {
        let send = ClientEvent::SendMessage(SendMessage {
            content: Some(content),
            chat_type: Some("global".to_string()),
            ..Default::default()
        });
        sink.send(frame(&send)?).await?;
    }

    info!("Listening for {}s", listen_for.as_secs());
    let deadline = tokio::time::sleep(listen_for);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            next = stream.next() => match next {
                Some(Ok(Message::Text(text))) => println!("<- {}", text),
                Some(Ok(Message::Close(_))) | None => {
                    println!("Server closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => anyhow::bail!("read error: {}", e),
            }
        }
    }

    let _ = sink.close().await;
    Ok(())
}
