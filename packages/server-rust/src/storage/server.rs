//! RESP front end for [`ListStore`].
//!
//! Speaks enough of the Redis protocol for the queue client: connection
//! commands plus the list primitives. Each connection is served by its own
//! task; commands on one connection run strictly in order, so a blocked
//! `BRPOP` holds back later commands on that connection only.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redmq_core::{Frame, RespCodec, RespError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::list_store::ListStore;

/// Per-connection state.
#[derive(Debug, Default)]
struct Session {
    authenticated: bool,
}

/// Serves one client until it disconnects.
///
/// A blocked `BRPOP` keeps reading the connection while it waits. Commands
/// that arrive meanwhile are queued behind it, and a client that hangs up
/// abandons the pop before anything is taken.
///
/// # Errors
///
/// Returns `RespError` if the client sends malformed framing or the socket fails.
pub async fn serve_connection<S>(stream: S, store: Arc<ListStore>) -> Result<(), RespError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, RespCodec::new());
    let mut session = Session {
        authenticated: store.password().is_none(),
    };
    let mut backlog: VecDeque<Frame> = VecDeque::new();

    loop {
        let frame = match backlog.pop_front() {
            Some(frame) => frame,
            None => match framed.next().await {
                Some(frame) => frame?,
                None => break,
            },
        };

        let args = match frame {
            Frame::Array(Some(items)) => command_args(items),
            other => Err(Frame::Error(format!(
                "ERR protocol error: expected array of bulk strings, got {}",
                other.kind()
            ))),
        };
        let reply = match args {
            Ok(args) if session.authenticated && is_blocking_pop(&args) => {
                match blocking_pop(&store, &args[1..], &mut framed, &mut backlog).await? {
                    BlockingPop::Reply(reply) => reply,
                    BlockingPop::Popped(key, value) => {
                        let reply = Frame::Array(Some(vec![
                            Frame::bulk(key.clone()),
                            Frame::Bulk(Some(value.clone())),
                        ]));
                        if let Err(err) = framed.send(reply).await {
                            // Nobody received it; put it back where it was.
                            store.rpush(&key, [value]);
                            return Err(err);
                        }
                        continue;
                    }
                    BlockingPop::Disconnected => {
                        debug!("client left during a blocking pop");
                        return Ok(());
                    }
                }
            }
            Ok(args) => execute(&store, &mut session, &args).await,
            Err(reply) => reply,
        };
        framed.send(reply).await?;
    }
    Ok(())
}

/// Accepts TCP clients until `shutdown` resolves.
///
/// # Errors
///
/// Returns an I/O error if accepting fails.
pub async fn serve(
    listener: TcpListener,
    store: Arc<ListStore>,
    shutdown: impl Future<Output = ()> + Send,
) -> std::io::Result<()> {
    tokio::pin!(shutdown);
    info!(addr = %listener.local_addr()?, "list store listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                if let Err(err) = socket.set_nodelay(true) {
                    warn!(%peer, error = %err, "failed to set TCP_NODELAY");
                }
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    debug!(%peer, "client connected");
                    if let Err(err) = serve_connection(socket, store).await {
                        warn!(%peer, error = %err, "client connection failed");
                    }
                    debug!(%peer, "client disconnected");
                });
            }
            () = &mut shutdown => {
                info!("list store shutting down");
                return Ok(());
            }
        }
    }
}

fn command_args(items: Vec<Frame>) -> Result<Vec<Bytes>, Frame> {
    if items.is_empty() {
        return Err(Frame::Error("ERR empty command".into()));
    }
    items
        .into_iter()
        .map(|item| match item {
            Frame::Bulk(Some(data)) => Ok(data),
            other => Err(Frame::Error(format!(
                "ERR protocol error: expected bulk string argument, got {}",
                other.kind()
            ))),
        })
        .collect()
}

async fn execute(store: &ListStore, session: &mut Session, args: &[Bytes]) -> Frame {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    let args = &args[1..];

    if !session.authenticated && name != "AUTH" {
        return Frame::Error("NOAUTH Authentication required.".into());
    }

    match dispatch(store, session, &name, args).await {
        Ok(frame) | Err(frame) => frame,
    }
}

async fn dispatch(
    store: &ListStore,
    session: &mut Session,
    name: &str,
    args: &[Bytes],
) -> Result<Frame, Frame> {
    let frame = match name {
        "PING" => match args {
            [] => Frame::Simple("PONG".into()),
            [message] => Frame::Bulk(Some(message.clone())),
            _ => return Err(arity(name)),
        },
        "ECHO" => {
            let [message] = args else { return Err(arity(name)) };
            Frame::Bulk(Some(message.clone()))
        }
        "AUTH" => {
            let [password] = args else { return Err(arity(name)) };
            match store.password() {
                None => return Err(Frame::Error(
                    "ERR AUTH called without any password configured".into(),
                )),
                Some(expected) if expected.as_bytes() == &password[..] => {
                    session.authenticated = true;
                    Frame::ok()
                }
                Some(_) => return Err(Frame::Error("WRONGPASS invalid password".into())),
            }
        }
        "SELECT" => {
            let [db] = args else { return Err(arity(name)) };
            parse_int(db)?;
            Frame::ok()
        }
        "LPUSH" | "RPUSH" => {
            let [key, values @ ..] = args else { return Err(arity(name)) };
            if values.is_empty() {
                return Err(arity(name));
            }
            let key = text(key)?;
            let values = values.iter().cloned();
            let len = if name == "LPUSH" {
                store.lpush(key, values)
            } else {
                store.rpush(key, values)
            };
            integer(len)
        }
        "LPOP" | "RPOP" => {
            let [key] = args else { return Err(arity(name)) };
            let key = text(key)?;
            let value = if name == "LPOP" {
                store.lpop(key)
            } else {
                store.rpop(key)
            };
            Frame::Bulk(value)
        }
        "LTRIM" => {
            let [key, start, stop] = args else { return Err(arity(name)) };
            store.ltrim(text(key)?, parse_int(start)?, parse_int(stop)?);
            Frame::ok()
        }
        "LLEN" => {
            let [key] = args else { return Err(arity(name)) };
            integer(store.llen(text(key)?))
        }
        "LRANGE" => {
            let [key, start, stop] = args else { return Err(arity(name)) };
            let items = store.lrange(text(key)?, parse_int(start)?, parse_int(stop)?);
            Frame::Array(Some(items.into_iter().map(|v| Frame::Bulk(Some(v))).collect()))
        }
        "DEL" => {
            if args.is_empty() {
                return Err(arity(name));
            }
            let keys = args.iter().map(text).collect::<Result<Vec<_>, _>>()?;
            integer(store.del(&keys))
        }
        "FLUSHALL" | "FLUSHDB" => {
            store.flush_all();
            Frame::ok()
        }
        _ => {
            return Err(Frame::Error(format!(
                "ERR unknown command '{}'",
                name.to_ascii_lowercase()
            )))
        }
    };
    Ok(frame)
}

fn is_blocking_pop(args: &[Bytes]) -> bool {
    args[0].eq_ignore_ascii_case(b"BRPOP")
}

enum BlockingPop {
    /// The command failed or timed out; send this reply.
    Reply(Frame),
    Popped(String, Bytes),
    Disconnected,
}

/// Waits on `BRPOP keys.. timeout` while watching the client. Frames that
/// arrive in the meantime go to `backlog`; end of input counts as a hang-up.
async fn blocking_pop<S>(
    store: &ListStore,
    args: &[Bytes],
    framed: &mut Framed<S, RespCodec>,
    backlog: &mut VecDeque<Frame>,
) -> Result<BlockingPop, RespError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (keys, timeout) = match brpop_args(args) {
        Ok(parsed) => parsed,
        Err(reply) => return Ok(BlockingPop::Reply(reply)),
    };

    let pop = store.brpop(&keys, timeout);
    tokio::pin!(pop);
    loop {
        tokio::select! {
            biased;
            next = framed.next() => match next {
                Some(frame) => backlog.push_back(frame?),
                None => return Ok(BlockingPop::Disconnected),
            },
            popped = &mut pop => {
                return Ok(match popped {
                    Some((key, value)) => BlockingPop::Popped(key, value),
                    None => BlockingPop::Reply(Frame::Array(None)),
                });
            }
        }
    }
}

fn brpop_args(args: &[Bytes]) -> Result<(Vec<&str>, Option<Duration>), Frame> {
    let [keys @ .., timeout] = args else { return Err(arity("BRPOP")) };
    if keys.is_empty() {
        return Err(arity("BRPOP"));
    }
    let keys = keys.iter().map(text).collect::<Result<Vec<_>, _>>()?;
    Ok((keys, parse_timeout(timeout)?))
}

fn arity(name: &str) -> Frame {
    Frame::Error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

fn integer(n: usize) -> Frame {
    Frame::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

fn text(arg: &Bytes) -> Result<&str, Frame> {
    std::str::from_utf8(arg).map_err(|_| Frame::Error("ERR key is not valid UTF-8".into()))
}

fn parse_int(arg: &Bytes) -> Result<i64, Frame> {
    text(arg)?
        .parse()
        .map_err(|_| Frame::Error("ERR value is not an integer or out of range".into()))
}

/// Fractional seconds; zero blocks forever.
fn parse_timeout(arg: &Bytes) -> Result<Option<Duration>, Frame> {
    let secs: f64 = text(arg)?
        .parse()
        .map_err(|_| Frame::Error("ERR timeout is not a float or out of range".into()))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(Frame::Error("ERR timeout is negative".into()));
    }
    if secs <= 0.0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_secs_f64(secs)))
}

#[cfg(test)]
mod tests {
    use redmq_core::Command;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn run(store: &Arc<ListStore>, cmds: &[Command]) -> Vec<Frame> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(server, Arc::clone(store)));

        for cmd in cmds {
            client.write_all(&cmd.to_bytes()).await.unwrap();
        }
        client.shutdown().await.unwrap();

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        task.await.unwrap().unwrap();

        let mut codec = RespCodec::new();
        let mut buf = bytes::BytesMut::from(&raw[..]);
        let mut frames = Vec::new();
        while let Some(frame) = tokio_util::codec::Decoder::decode(&mut codec, &mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    /// Like `run`, but keeps the write half open until `replies` frames came back.
    async fn exchange(store: &Arc<ListStore>, cmds: &[Command], replies: usize) -> Vec<Frame> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(server, Arc::clone(store)));

        for cmd in cmds {
            client.write_all(&cmd.to_bytes()).await.unwrap();
        }
        let mut codec = RespCodec::new();
        let mut buf = bytes::BytesMut::new();
        let mut frames = Vec::new();
        while frames.len() < replies {
            match tokio_util::codec::Decoder::decode(&mut codec, &mut buf).unwrap() {
                Some(frame) => frames.push(frame),
                None => {
                    assert_ne!(client.read_buf(&mut buf).await.unwrap(), 0, "server hung up");
                }
            }
        }
        drop(client);
        task.await.unwrap().unwrap();
        frames
    }

    #[tokio::test]
    async fn list_commands_round_trip() {
        let store = Arc::new(ListStore::new());
        let replies = run(
            &store,
            &[
                Command::lpush("q", "a"),
                Command::lpush("q", "b"),
                Command::llen("q"),
                Command::rpop("q"),
                Command::lrange("q", 0, -1),
                Command::del(&["q"]),
                Command::rpop("q"),
            ],
        )
        .await;

        assert_eq!(
            replies,
            vec![
                Frame::Integer(1),
                Frame::Integer(2),
                Frame::Integer(2),
                Frame::bulk("a"),
                Frame::Array(Some(vec![Frame::bulk("b")])),
                Frame::Integer(1),
                Frame::Bulk(None),
            ]
        );
    }

    #[tokio::test]
    async fn brpop_reply_names_the_key() {
        let store = Arc::new(ListStore::new());
        store.lpush("B.inq", [Bytes::from_static(b"x")]);
        let replies = exchange(
            &store,
            &[
                Command::brpop(&["A.inq", "B.inq"], Duration::from_millis(10)),
                Command::brpop(&["A.inq", "B.inq"], Duration::from_millis(10)),
            ],
            2,
        )
        .await;
        assert_eq!(
            replies,
            vec![
                Frame::Array(Some(vec![Frame::bulk("B.inq"), Frame::bulk("x")])),
                Frame::Array(None),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_and_malformed_commands_get_error_replies() {
        let store = Arc::new(ListStore::new());
        let replies = run(
            &store,
            &[Command::new("HGETALL").arg("h"), Command::new("LLEN"), Command::ping()],
        )
        .await;
        assert_eq!(replies[0], Frame::Error("ERR unknown command 'hgetall'".into()));
        assert_eq!(
            replies[1],
            Frame::Error("ERR wrong number of arguments for 'llen' command".into())
        );
        assert_eq!(replies[2], Frame::Simple("PONG".into()));
    }

    #[tokio::test]
    async fn password_gates_every_command_but_auth() {
        let store = Arc::new(ListStore::with_password("pw"));
        let replies = run(
            &store,
            &[Command::ping(), Command::auth("pw"), Command::ping()],
        )
        .await;
        assert!(matches!(&replies[0], Frame::Error(e) if e.starts_with("NOAUTH")));
        assert_eq!(replies[1], Frame::ok());
        assert_eq!(replies[2], Frame::Simple("PONG".into()));
    }

    #[tokio::test]
    async fn client_leaving_a_blocked_pop_takes_nothing() {
        let store = Arc::new(ListStore::new());
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(server, Arc::clone(&store)));

        let cmd = Command::brpop(&["q"], Duration::from_secs(5));
        client.write_all(&cmd.to_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        store.lpush("q", [Bytes::from_static(b"payload")]);
        assert_eq!(store.rpop("q").as_deref(), Some(&b"payload"[..]));
    }

    #[tokio::test]
    async fn commands_sent_behind_a_blocked_pop_still_run_in_order() {
        let store = Arc::new(ListStore::new());
        let replies = exchange(
            &store,
            &[
                Command::brpop(&["q"], Duration::from_millis(100)),
                Command::ping(),
                Command::llen("q"),
            ],
            3,
        )
        .await;
        assert_eq!(
            replies,
            vec![Frame::Array(None), Frame::Simple("PONG".into()), Frame::Integer(0)]
        );
    }

    #[tokio::test]
    async fn hang_up_during_a_blocked_pop_ends_the_connection_cleanly() {
        let store = Arc::new(ListStore::new());
        let replies = run(&store, &[Command::brpop(&["q"], Duration::from_secs(5))]).await;
        assert!(replies.is_empty());
    }

    #[test]
    fn timeouts_parse_as_fractional_seconds() {
        assert_eq!(
            parse_timeout(&Bytes::from_static(b"0.250")).unwrap(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(parse_timeout(&Bytes::from_static(b"0")).unwrap(), None);
        assert!(parse_timeout(&Bytes::from_static(b"-1")).is_err());
    }
}
